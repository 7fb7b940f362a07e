use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::allocation::{ChannelAllocation, ChannelAllocationStrategy};
use super::ids::{Converter, Filter, SubscriberGroupId, SubscriberId, SubscriptionId, SubscriptionKey};
use crate::error::ProtocolError;

/// Membership record of one subscriber group in one topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub key: SubscriptionKey,
    pub filter: Option<Filter>,
    pub converter: Option<Converter>,
    pub subscribers: BTreeSet<SubscriberId>,
    pub allocation: ChannelAllocation,
    pub channel_count: u32,
}

impl Subscription {
    pub fn new(
        id: SubscriptionId,
        key: SubscriptionKey,
        filter: Option<Filter>,
        converter: Option<Converter>,
    ) -> Self {
        Self {
            id,
            key,
            filter,
            converter,
            subscribers: BTreeSet::new(),
            allocation: ChannelAllocation::default(),
            channel_count: 0,
        }
    }

    pub fn topic(&self) -> &str {
        &self.key.topic
    }

    pub fn group(&self) -> &SubscriberGroupId {
        &self.key.group
    }

    pub fn is_anonymous(&self) -> bool {
        self.key.group.is_anonymous()
    }

    pub fn has_subscriber(&self, subscriber: &SubscriberId) -> bool {
        self.subscribers.contains(subscriber)
    }

    /// Filter and converter are fixed at creation.
    pub fn assert_filter_and_converter(
        &self,
        filter: Option<&Filter>,
        converter: Option<&Converter>,
    ) -> Result<(), ProtocolError> {
        if self.filter.as_ref() != filter || self.converter.as_ref() != converter {
            return Err(ProtocolError::Conflict {
                key: self.key.clone(),
            });
        }
        Ok(())
    }

    /// Returns true when at least one subscriber was new.
    pub fn add_subscribers(&mut self, subscribers: &[SubscriberId]) -> bool {
        let mut changed = false;
        for subscriber in subscribers.iter().filter(|s| !s.is_null()) {
            changed |= self.subscribers.insert(*subscriber);
        }
        changed
    }

    /// Returns true when at least one subscriber was present.
    pub fn remove_subscribers(&mut self, subscribers: &[SubscriberId]) -> bool {
        let mut changed = false;
        for subscriber in subscribers {
            changed |= self.subscribers.remove(subscriber);
        }
        changed
    }

    pub fn remove_all_subscribers(&mut self) -> bool {
        let changed = !self.subscribers.is_empty();
        self.subscribers.clear();
        changed
    }

    /// Recomputes the allocation; returns true when it or the count changed.
    pub fn update_channel_allocations(
        &mut self,
        strategy: &dyn ChannelAllocationStrategy,
        channel_count: u32,
    ) -> bool {
        let allocation = strategy.allocate(&self.subscribers, channel_count);
        if allocation == self.allocation && channel_count == self.channel_count {
            return false;
        }
        self.allocation = allocation;
        self.channel_count = channel_count;
        true
    }

    /// Allocation no longer matches the subscriber set or the channel count.
    pub fn needs_reallocation(&self, strategy: &dyn ChannelAllocationStrategy, channel_count: u32) -> bool {
        self.channel_count != channel_count || strategy.allocate(&self.subscribers, channel_count) != self.allocation
    }

    /// Field-level merge of a newer copy of the same subscription.
    pub fn update(&mut self, other: &Subscription) -> bool {
        if self == other {
            return false;
        }
        self.subscribers = other.subscribers.clone();
        self.allocation = other.allocation.clone();
        self.channel_count = other.channel_count;
        self.filter = other.filter.clone();
        self.converter = other.converter.clone();
        true
    }

    pub fn channels_of(&self, subscriber: &SubscriberId) -> Vec<u32> {
        self.allocation.channels_of(subscriber)
    }
}
