use serde::{Deserialize, Serialize};

use crate::model::{SubscriptionId, SubscriptionKey};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt frame: {0}")]
    Corrupt(&'static str),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Config(String),
    #[error("cannot change the filter or converter of existing subscription {key}")]
    Conflict { key: SubscriptionKey },
    #[error("subscription {0} has been destroyed")]
    SubscriptionDestroyed(SubscriptionId),
    #[error("subscription {0} is invalid")]
    InvalidSubscription(SubscriptionId),
    #[error("timed out after {millis}ms waiting for {what}")]
    Timeout { what: String, millis: u64 },
    #[error("member {0} departed")]
    MemberDeparted(u32),
    #[error("service stopped")]
    ServiceStopped,
    #[error("request rejected: {0}")]
    Protocol(ProtocolError),
}

impl Error {
    /// Transient failures that a caller loop may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout { .. }
                | Error::MemberDeparted(_)
                | Error::Protocol(ProtocolError::NotSenior)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure carried inside a protocol response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolError {
    Conflict { key: SubscriptionKey },
    Destroyed { id: SubscriptionId },
    Invalid { id: SubscriptionId },
    NotSenior,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Conflict { key } => write!(f, "filter/converter conflict on {key}"),
            ProtocolError::Destroyed { id } => write!(f, "subscription {id} has been destroyed"),
            ProtocolError::Invalid { id } => write!(f, "subscription {id} is invalid"),
            ProtocolError::NotSenior => write!(f, "receiver is not the senior member"),
        }
    }
}

impl From<ProtocolError> for Error {
    fn from(value: ProtocolError) -> Self {
        match value {
            ProtocolError::Conflict { key } => Error::Conflict { key },
            ProtocolError::Destroyed { id } => Error::SubscriptionDestroyed(id),
            ProtocolError::Invalid { id } => Error::InvalidSubscription(id),
            other => Error::Protocol(other),
        }
    }
}
