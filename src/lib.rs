//! Senior-arbitrated coordination of topic subscriptions and channel counts.
//!
//! A topic service runs on every cluster member. The oldest member (the senior)
//! is the single arbiter for subscription ids, subscriber membership and the
//! topic channel count. Its decisions are persisted in a replicated config map
//! that every member mirrors into a local subscription registry.

pub mod cleanup;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod config_map;
pub mod confirm;
pub mod coordinator;
pub mod error;
pub mod model;
pub mod protocol;
pub mod registry;
pub mod service;
mod sync;
pub mod topics;

pub use clock::{Clock, ManualClock, QuantaClock, SystemClock};
pub use cluster::local::LocalCluster;
pub use cluster::{MemberId, PartitionSet, ProtocolTier};
pub use config::{ServiceConfig, TopicConfig};
pub use error::{Error, ProtocolError, Result};
pub use model::{
    ChannelAllocation, ChannelAllocationStrategy, Converter, Filter, SimpleChannelAllocationStrategy,
    SubscriberGroupId, SubscriberId, Subscription, SubscriptionId, SubscriptionKey,
};
pub use registry::{SubscriptionListener, SubscriptionRegistry};
pub use service::TopicService;
pub use topics::NamedTopic;
