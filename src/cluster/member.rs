use std::fmt;

use serde::{Deserialize, Serialize};

/// Cluster member identity. Zero is reserved for "no member".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(pub u32);

impl MemberId {
    pub const NONE: MemberId = MemberId(0);
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "member-{}", self.0)
    }
}

/// Coordination features a member understands, ordered oldest to newest.
///
/// Requests addressed to a member below the tier an operation requires are
/// skipped, answered with the not-compatible sentinel, or treated as
/// confirmed, depending on the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProtocolTier {
    /// Topics and channels only; no senior-arbitrated subscriptions.
    Legacy = 1,
    /// Adds senior-driven channel-count increases and their confirmation.
    ChannelCount = 2,
    /// Adds subscription ids, subscriber confirmation and cleanup.
    Subscriptions = 3,
}

impl ProtocolTier {
    pub const CURRENT: ProtocolTier = ProtocolTier::Subscriptions;

    pub fn supports(self, required: ProtocolTier) -> bool {
        self >= required
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_are_ordered() {
        assert!(ProtocolTier::Subscriptions.supports(ProtocolTier::ChannelCount));
        assert!(!ProtocolTier::Legacy.supports(ProtocolTier::ChannelCount));
        assert!(ProtocolTier::ChannelCount.supports(ProtocolTier::ChannelCount));
    }
}
