use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cluster::MemberId;

/// Cluster-unique id of one subscription (subscriber group in a topic).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub i64);

impl SubscriptionId {
    /// Caller does not know the id yet; the senior resolves or allocates one.
    pub const UNKNOWN: SubscriptionId = SubscriptionId(0);
    /// Reply sentinel: the senior runs a protocol tier without subscription ids.
    pub const NOT_COMPATIBLE: SubscriptionId = SubscriptionId(-1);

    /// Member bits kept in the high word; the sign bit stays clear.
    pub const MEMBER_MASK: u32 = 0x7fff_ffff;

    /// Ids handed out by a senior: the member id in the high word, a counter below.
    pub fn compose(member: MemberId, sequence: u32) -> Self {
        let member = i64::from(member.0 & Self::MEMBER_MASK);
        SubscriptionId((member << 32) | i64::from(sequence))
    }

    pub fn is_unknown(self) -> bool {
        self == Self::UNKNOWN
    }

    pub fn is_not_compatible(self) -> bool {
        self == Self::NOT_COMPATIBLE
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One subscriber instance, tagged with the member that hosts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriberId {
    pub id: u64,
    pub member: MemberId,
}

impl SubscriberId {
    /// Stands for "the whole group" in destroy requests.
    pub const NULL: SubscriberId = SubscriberId {
        id: 0,
        member: MemberId::NONE,
    };

    pub fn new(id: u64, member: MemberId) -> Self {
        Self { id, member }
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.member)
    }
}

/// Named durable group, or a private group owned by a single subscriber.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SubscriberGroupId {
    Durable(String),
    Anonymous(SubscriberId),
}

impl SubscriberGroupId {
    pub fn durable(name: impl Into<String>) -> Self {
        SubscriberGroupId::Durable(name.into())
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, SubscriberGroupId::Anonymous(_))
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            SubscriberGroupId::Durable(name) => Some(name),
            SubscriberGroupId::Anonymous(_) => None,
        }
    }
}

impl fmt::Display for SubscriberGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriberGroupId::Durable(name) => f.write_str(name),
            SubscriberGroupId::Anonymous(owner) => write!(f, "anonymous-{owner}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub topic: String,
    pub group: SubscriberGroupId,
}

impl SubscriptionKey {
    pub fn new(topic: impl Into<String>, group: SubscriberGroupId) -> Self {
        Self {
            topic: topic.into(),
            group,
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.group)
    }
}

/// Opaque filter expression evaluated by the storage tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filter(pub String);

/// Opaque value converter applied before delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Converter(pub String);

impl From<&str> for Filter {
    fn from(value: &str) -> Self {
        Filter(value.to_string())
    }
}

impl From<&str> for Converter {
    fn from(value: &str) -> Self {
        Converter(value.to_string())
    }
}
