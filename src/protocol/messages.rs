use serde::{Deserialize, Serialize};

use crate::cluster::{MemberId, PartitionSet, ProtocolTier};
use crate::config_map::{ConfigKey, ConfigUpdate, ConfigValue};
use crate::error::ProtocolError;
use crate::model::{Converter, Filter, SubscriberGroupId, SubscriberId, SubscriptionId, SubscriptionKey};

/// Addressing wrapper around every message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: MemberId,
    /// Sender-local request id; replies carry it back in `reply_to`.
    pub id: u64,
    pub reply_to: Option<u64>,
    /// Set when a non-senior relayed the request; the receiver must not relay again.
    #[serde(default)]
    pub forwarded: bool,
    pub message: Message,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    SubscriberId(SubscriberIdRequest),
    SetChannelCount(SetChannelCountRequest),
    Topic(TopicRequest),
    SubscriberConfirm(SubscriberConfirmRequest),
    ChannelCountConfirm(ChannelCountConfirmRequest),
    Response(Response),
    PartialValue(PartialValueResponse),
    ConfigUpdate(ConfigUpdate),
    Welcome(Vec<(ConfigKey, ConfigValue)>),
}

impl Message {
    /// Requests only the senior may decide.
    pub fn is_senior_request(&self) -> bool {
        matches!(
            self,
            Message::SubscriberId(_) | Message::SetChannelCount(_) | Message::Topic(_)
        )
    }

    /// Lowest tier the senior must run to decide this request.
    pub fn required_tier(&self) -> ProtocolTier {
        match self {
            Message::SubscriberId(_) | Message::SubscriberConfirm(_) => ProtocolTier::Subscriptions,
            Message::SetChannelCount(_) | Message::ChannelCountConfirm(_) => ProtocolTier::ChannelCount,
            _ => ProtocolTier::Legacy,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::SubscriberId(_) => "SubscriberIdRequest",
            Message::SetChannelCount(_) => "SetChannelCountRequest",
            Message::Topic(_) => "TopicRequest",
            Message::SubscriberConfirm(_) => "SubscriberConfirmRequest",
            Message::ChannelCountConfirm(_) => "ChannelCountConfirmRequest",
            Message::Response(_) => "Response",
            Message::PartialValue(_) => "PartialValueResponse",
            Message::ConfigUpdate(_) => "ConfigUpdate",
            Message::Welcome(_) => "Welcome",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriberAction {
    Create,
    Destroy,
    /// Recompute the allocation against the current channel count.
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberIdRequest {
    pub topic: String,
    /// Required when `subscription_id` is unknown.
    pub group: Option<SubscriberGroupId>,
    pub subscription_id: SubscriptionId,
    /// Empty: whole group. `[SubscriberId::NULL]` on destroy: every subscriber.
    pub subscribers: Vec<SubscriberId>,
    pub action: SubscriberAction,
    pub filter: Option<Filter>,
    pub converter: Option<Converter>,
}

impl SubscriberIdRequest {
    pub fn create(key: &SubscriptionKey, subscribers: Vec<SubscriberId>) -> Self {
        Self {
            topic: key.topic.clone(),
            group: Some(key.group.clone()),
            subscription_id: SubscriptionId::UNKNOWN,
            subscribers,
            action: SubscriberAction::Create,
            filter: None,
            converter: None,
        }
    }

    pub fn destroy(topic: &str, id: SubscriptionId, subscribers: Vec<SubscriberId>) -> Self {
        Self {
            topic: topic.to_string(),
            group: None,
            subscription_id: id,
            subscribers,
            action: SubscriberAction::Destroy,
            filter: None,
            converter: None,
        }
    }

    pub fn with_filter(mut self, filter: Option<Filter>, converter: Option<Converter>) -> Self {
        self.filter = filter;
        self.converter = converter;
        self
    }

    pub fn key(&self) -> Option<SubscriptionKey> {
        self.group
            .as_ref()
            .map(|group| SubscriptionKey::new(self.topic.clone(), group.clone()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetChannelCountRequest {
    pub topic: String,
    pub required: u32,
    pub total: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopicRequest {
    Create { topic: String },
    Destroy { topic: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberConfirmRequest {
    pub subscription_id: SubscriptionId,
    pub subscriber: SubscriberId,
    /// Partitions the requester still needs confirmed by the receiver.
    pub partitions: PartitionSet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelCountConfirmRequest {
    pub topic: String,
    pub channel_count: u32,
    pub partitions: PartitionSet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Success(i64),
    Failure(ProtocolError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialValueResponse {
    /// Requested partitions the receiver could not confirm.
    pub rejected: PartitionSet,
    /// Set when the subject was concurrently destroyed.
    pub error: Option<ProtocolError>,
}
