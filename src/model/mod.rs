//! Subscription data model shared by every member.

mod allocation;
mod ids;
mod subscription;

pub use allocation::{ChannelAllocation, ChannelAllocationStrategy, SimpleChannelAllocationStrategy};
pub use ids::{Converter, Filter, SubscriberGroupId, SubscriberId, SubscriptionId, SubscriptionKey};
pub use subscription::Subscription;
