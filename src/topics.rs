//! Client-visible topic handles.
//!
//! The store has its own lock, independent of the subscription registry. The
//! senior also holds it while changing a topic's channel count or registering
//! a topic, so those two never interleave.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::{ServiceConfig, DEFAULT_TOPIC_NAME};
use crate::config_map::ConfigMap;
use crate::model::{SubscriberGroupId, SubscriberId};
use crate::sync::lock;

/// Handle on one topic; reads are served from the local config map.
#[derive(Clone)]
pub struct NamedTopic {
    name: String,
    config: Arc<ServiceConfig>,
    config_map: Arc<ConfigMap>,
}

impl NamedTopic {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel_count(&self) -> u32 {
        self.config_map
            .channel_count(&self.name)
            .unwrap_or_else(|| self.config.channel_count(&self.name))
    }

    pub fn subscriber_groups(&self) -> BTreeSet<SubscriberGroupId> {
        self.config_map.subscriber_groups(&self.name)
    }

    pub fn subscribers(&self, group: &SubscriberGroupId) -> BTreeSet<SubscriberId> {
        self.config_map.subscribers(&self.name, group)
    }
}

impl std::fmt::Debug for NamedTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedTopic").field("name", &self.name).finish()
    }
}

pub struct TopicStore {
    config: Arc<ServiceConfig>,
    config_map: Arc<ConfigMap>,
    topics: Mutex<HashMap<String, NamedTopic>>,
}

impl TopicStore {
    pub fn new(config: Arc<ServiceConfig>, config_map: Arc<ConfigMap>) -> Self {
        Self {
            config,
            config_map,
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Empty names map to the default topic.
    pub fn normalize(name: &str) -> &str {
        if name.is_empty() {
            DEFAULT_TOPIC_NAME
        } else {
            name
        }
    }

    /// Holds the store lock; used to serialize topic-level changes.
    pub fn lock(&self) -> MutexGuard<'_, HashMap<String, NamedTopic>> {
        lock(&self.topics)
    }

    pub fn ensure(&self, name: &str) -> NamedTopic {
        let name = Self::normalize(name);
        self.lock()
            .entry(name.to_string())
            .or_insert_with(|| NamedTopic {
                name: name.to_string(),
                config: Arc::clone(&self.config),
                config_map: Arc::clone(&self.config_map),
            })
            .clone()
    }

    pub fn release(&self, name: &str) -> bool {
        self.lock().remove(Self::normalize(name)).is_some()
    }

    pub fn cached(&self) -> BTreeSet<String> {
        self.lock().keys().cloned().collect()
    }
}
