//! Replicated topic configuration map.
//!
//! Every member holds a full copy. Only the senior mutates it locally; each
//! local mutation is handed to the [`Replicator`] while the map lock is held, so
//! remote members observe updates in the order the senior applied them.
//! Listeners run after the lock is released and see whether an event came from
//! a local write or a replicated one.

mod topics;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::cluster::MemberId;
use crate::model::{Subscription, SubscriptionKey};
use crate::registry::notify_isolated;
use crate::sync::lock;

/// Typed keys; listeners dispatch on the variant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConfigKey {
    Topic(String),
    Subscription(SubscriptionKey),
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicInfo {
    pub channel_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConfigValue {
    Topic(TopicInfo),
    Subscription(Subscription),
    Other(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConfigUpdate {
    Put(ConfigKey, ConfigValue),
    Remove(ConfigKey),
}

impl ConfigUpdate {
    pub fn key(&self) -> &ConfigKey {
        match self {
            ConfigUpdate::Put(key, _) | ConfigUpdate::Remove(key) => key,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Inserted,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

#[derive(Debug, Clone)]
pub struct ConfigEvent {
    pub kind: EventKind,
    pub key: ConfigKey,
    pub old: Option<ConfigValue>,
    pub new: Option<ConfigValue>,
    pub origin: Origin,
}

pub trait ConfigListener: Send + Sync {
    fn on_event(&self, event: &ConfigEvent) -> anyhow::Result<()>;
}

/// Ships local mutations to the other members.
pub trait Replicator: Send + Sync {
    fn replicate(&self, update: &ConfigUpdate);

    /// Sends the full (filtered) contents to a member that just joined.
    fn welcome(&self, to: MemberId, entries: Vec<(ConfigKey, ConfigValue)>);
}

pub struct ConfigMap {
    entries: Mutex<BTreeMap<ConfigKey, ConfigValue>>,
    listeners: Mutex<Vec<Arc<dyn ConfigListener>>>,
    replicator: Option<Arc<dyn Replicator>>,
}

impl ConfigMap {
    pub fn new(replicator: Option<Arc<dyn Replicator>>) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            listeners: Mutex::new(Vec::new()),
            replicator,
        }
    }

    /// A map that never replicates; used by tests and single-member tools.
    pub fn standalone() -> Self {
        Self::new(None)
    }

    pub fn add_listener(&self, listener: Arc<dyn ConfigListener>) {
        lock(&self.listeners).push(listener);
    }

    pub fn get(&self, key: &ConfigKey) -> Option<ConfigValue> {
        lock(&self.entries).get(key).cloned()
    }

    pub fn contains(&self, key: &ConfigKey) -> bool {
        lock(&self.entries).contains_key(key)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries matching `filter`, cloned out of the lock.
    pub fn entries_where<F>(&self, mut filter: F) -> Vec<(ConfigKey, ConfigValue)>
    where
        F: FnMut(&ConfigKey, &ConfigValue) -> bool,
    {
        lock(&self.entries)
            .iter()
            .filter(|(k, v)| filter(k, v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Local write. Returns false when the stored value was already equal.
    pub fn put(&self, key: ConfigKey, value: ConfigValue) -> bool {
        let old = {
            let mut entries = lock(&self.entries);
            if entries.get(&key) == Some(&value) {
                return false;
            }
            let old = entries.insert(key.clone(), value.clone());
            if let Some(replicator) = &self.replicator {
                replicator.replicate(&ConfigUpdate::Put(key.clone(), value.clone()));
            }
            old
        };
        self.fire(Self::put_event(key, old, value, Origin::Local));
        true
    }

    /// Local removal; returns the removed value.
    pub fn remove(&self, key: &ConfigKey) -> Option<ConfigValue> {
        let old = {
            let mut entries = lock(&self.entries);
            let old = entries.remove(key)?;
            if let Some(replicator) = &self.replicator {
                replicator.replicate(&ConfigUpdate::Remove(key.clone()));
            }
            old
        };
        self.fire(ConfigEvent {
            kind: EventKind::Deleted,
            key: key.clone(),
            old: Some(old.clone()),
            new: None,
            origin: Origin::Local,
        });
        Some(old)
    }

    /// Applies an update replicated from the senior.
    pub fn apply_remote(&self, update: ConfigUpdate) {
        let event = {
            let mut entries = lock(&self.entries);
            match update {
                ConfigUpdate::Put(key, value) => {
                    if entries.get(&key) == Some(&value) {
                        return;
                    }
                    let old = entries.insert(key.clone(), value.clone());
                    Self::put_event(key, old, value, Origin::Remote)
                }
                ConfigUpdate::Remove(key) => {
                    let Some(old) = entries.remove(&key) else {
                        return;
                    };
                    ConfigEvent {
                        kind: EventKind::Deleted,
                        key,
                        old: Some(old),
                        new: None,
                        origin: Origin::Remote,
                    }
                }
            }
        };
        self.fire(event);
    }

    /// Snapshots the map and hands it to the replicator as one atomic step.
    pub fn send_welcome(&self, to: MemberId) {
        let Some(replicator) = &self.replicator else {
            return;
        };
        let entries = lock(&self.entries);
        let snapshot = entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        replicator.welcome(to, snapshot);
    }

    /// Replaces the contents with a welcome snapshot, firing remote events for the diff.
    pub fn apply_snapshot(&self, snapshot: Vec<(ConfigKey, ConfigValue)>) {
        let events = {
            let mut entries = lock(&self.entries);
            let incoming: BTreeMap<ConfigKey, ConfigValue> = snapshot.into_iter().collect();
            let mut events = Vec::new();
            for (key, old) in entries.iter() {
                if !incoming.contains_key(key) {
                    events.push(ConfigEvent {
                        kind: EventKind::Deleted,
                        key: key.clone(),
                        old: Some(old.clone()),
                        new: None,
                        origin: Origin::Remote,
                    });
                }
            }
            for (key, value) in &incoming {
                let old = entries.get(key);
                if old != Some(value) {
                    events.push(Self::put_event(key.clone(), old.cloned(), value.clone(), Origin::Remote));
                }
            }
            *entries = incoming;
            events
        };
        for event in events {
            self.fire(event);
        }
    }

    fn put_event(key: ConfigKey, old: Option<ConfigValue>, new: ConfigValue, origin: Origin) -> ConfigEvent {
        ConfigEvent {
            kind: if old.is_some() {
                EventKind::Updated
            } else {
                EventKind::Inserted
            },
            key,
            old,
            new: Some(new),
            origin,
        }
    }

    fn fire(&self, event: ConfigEvent) {
        let listeners = lock(&self.listeners).clone();
        for listener in listeners {
            notify_isolated("config map listener", || listener.on_event(&event));
        }
    }
}
