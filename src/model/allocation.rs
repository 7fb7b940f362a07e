use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::ids::SubscriberId;

/// Channel owner per channel index; `None` when the group has no subscribers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelAllocation {
    by_channel: Vec<Option<SubscriberId>>,
}

impl ChannelAllocation {
    pub fn from_owners(by_channel: Vec<Option<SubscriberId>>) -> Self {
        Self { by_channel }
    }

    pub fn channel_count(&self) -> u32 {
        self.by_channel.len() as u32
    }

    pub fn owner(&self, channel: u32) -> Option<SubscriberId> {
        self.by_channel.get(channel as usize).copied().flatten()
    }

    /// Channels assigned to `subscriber`, ascending.
    pub fn channels_of(&self, subscriber: &SubscriberId) -> Vec<u32> {
        self.by_channel
            .iter()
            .enumerate()
            .filter(|(_, owner)| owner.as_ref() == Some(subscriber))
            .map(|(channel, _)| channel as u32)
            .collect()
    }

    pub fn by_subscriber(&self) -> BTreeMap<SubscriberId, Vec<u32>> {
        let mut map: BTreeMap<SubscriberId, Vec<u32>> = BTreeMap::new();
        for (channel, owner) in self.by_channel.iter().enumerate() {
            if let Some(owner) = owner {
                map.entry(*owner).or_default().push(channel as u32);
            }
        }
        map
    }
}

/// Pure mapping from (subscribers, channel count) to a channel allocation.
///
/// Implementations must be deterministic: the coordinator recomputes the
/// allocation on every membership or channel-count change and relies on equal
/// inputs producing equal outputs to detect "nothing changed".
pub trait ChannelAllocationStrategy: Send + Sync {
    fn allocate(&self, subscribers: &BTreeSet<SubscriberId>, channel_count: u32) -> ChannelAllocation;
}

/// Round-robin over the sorted subscriber set.
///
/// With more subscribers than channels the surplus subscribers own nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleChannelAllocationStrategy;

impl ChannelAllocationStrategy for SimpleChannelAllocationStrategy {
    fn allocate(&self, subscribers: &BTreeSet<SubscriberId>, channel_count: u32) -> ChannelAllocation {
        let owners: Vec<SubscriberId> = subscribers.iter().copied().collect();
        let by_channel = (0..channel_count as usize)
            .map(|channel| {
                if owners.is_empty() {
                    None
                } else {
                    Some(owners[channel % owners.len()])
                }
            })
            .collect();
        ChannelAllocation { by_channel }
    }
}
