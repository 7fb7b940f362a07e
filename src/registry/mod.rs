//! Per-member registry of live subscriptions.
//!
//! All mutation happens inside [`SubscriptionRegistry::locked`], which holds the
//! registry-wide lock for the duration of the closure. Listener callbacks and
//! management registration run after the lock is released, in mutation order,
//! so a listener may read the registry again without deadlocking.

mod graveyard;

use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

pub use graveyard::Graveyard;

use crate::clock::Clock;
use crate::cluster::Registrar;
use crate::config::ServiceConfig;
use crate::config_map::{ConfigEvent, ConfigKey, ConfigListener, ConfigValue, EventKind, Origin};
use crate::error::ProtocolError;
use crate::model::{SubscriberGroupId, Subscription, SubscriptionId, SubscriptionKey};
use crate::sync::lock;

/// Observer of registry changes. Failures are logged and never reach the mutator.
pub trait SubscriptionListener: Send + Sync {
    fn on_insert(&self, _subscription: &Subscription) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_update(&self, _subscription: &Subscription) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_delete(&self, _id: SubscriptionId, _key: &SubscriptionKey) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Runs one listener callback, containing both errors and panics.
pub(crate) fn notify_isolated<F>(what: &str, f: F)
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => log::warn!("{what} failed: {err:#}"),
        Err(_) => log::warn!("{what} panicked"),
    }
}

#[derive(Debug, Clone)]
enum RegistryEvent {
    Inserted(Subscription),
    Updated(Subscription),
    Deleted(SubscriptionId, SubscriptionKey),
}

struct RegistryState {
    by_id: BTreeMap<SubscriptionId, Subscription>,
    by_key: HashMap<SubscriptionKey, SubscriptionId>,
    graveyard: Graveyard,
}

pub struct SubscriptionRegistry {
    state: Mutex<RegistryState>,
    listeners: Mutex<Vec<Arc<dyn SubscriptionListener>>>,
    registrar: Arc<dyn Registrar>,
}

/// Mutable view of the registry while its lock is held.
pub struct RegistryTxn<'a> {
    state: &'a mut RegistryState,
    events: Vec<RegistryEvent>,
}

impl SubscriptionRegistry {
    pub fn new(clock: Arc<dyn Clock>, config: &ServiceConfig, registrar: Arc<dyn Registrar>) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                by_id: BTreeMap::new(),
                by_key: HashMap::new(),
                graveyard: Graveyard::new(clock, config.graveyard_ttl_ms, config.graveyard_capacity),
            }),
            listeners: Mutex::new(Vec::new()),
            registrar,
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn SubscriptionListener>) {
        lock(&self.listeners).push(listener);
    }

    /// Runs `f` under the registry lock, then delivers the resulting events.
    pub fn locked<R>(&self, f: impl FnOnce(&mut RegistryTxn<'_>) -> R) -> R {
        let (result, events) = {
            let mut state = lock(&self.state);
            let mut txn = RegistryTxn {
                state: &mut *state,
                events: Vec::new(),
            };
            let result = f(&mut txn);
            (result, txn.events)
        };
        self.deliver(events);
        result
    }

    pub fn ensure(&self, subscription: Subscription) -> Result<SubscriptionId, ProtocolError> {
        self.locked(|txn| txn.ensure(subscription))
    }

    pub fn destroy(&self, id: SubscriptionId) -> bool {
        self.locked(|txn| txn.destroy(id))
    }

    pub fn get(&self, id: SubscriptionId) -> Option<Subscription> {
        lock(&self.state).by_id.get(&id).cloned()
    }

    pub fn get_by_key(&self, topic: &str, group: &SubscriberGroupId) -> Option<Subscription> {
        let state = lock(&self.state);
        let id = state.by_key.get(&SubscriptionKey::new(topic, group.clone()))?;
        state.by_id.get(id).cloned()
    }

    pub fn is_destroyed(&self, id: SubscriptionId) -> bool {
        lock(&self.state).graveyard.contains(id)
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        lock(&self.state).by_id.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn deliver(&self, events: Vec<RegistryEvent>) {
        if events.is_empty() {
            return;
        }
        let listeners = lock(&self.listeners).clone();
        for event in events {
            match &event {
                RegistryEvent::Inserted(sub) if !sub.is_anonymous() => {
                    notify_isolated("registrar", || {
                        self.registrar.register(sub);
                        Ok(())
                    });
                }
                RegistryEvent::Deleted(id, key) if !key.group.is_anonymous() => {
                    notify_isolated("registrar", || {
                        self.registrar.unregister(key, *id);
                        Ok(())
                    });
                }
                _ => {}
            }
            for listener in &listeners {
                notify_isolated("subscription listener", || match &event {
                    RegistryEvent::Inserted(sub) => listener.on_insert(sub),
                    RegistryEvent::Updated(sub) => listener.on_update(sub),
                    RegistryEvent::Deleted(id, key) => listener.on_delete(*id, key),
                });
            }
        }
    }
}

impl RegistryTxn<'_> {
    /// Inserts or merges `subscription`. Ids in the graveyard are never revived.
    pub fn ensure(&mut self, subscription: Subscription) -> Result<SubscriptionId, ProtocolError> {
        let id = subscription.id;
        if let Some(existing) = self.state.by_id.get_mut(&id) {
            if existing.update(&subscription) {
                self.events.push(RegistryEvent::Updated(existing.clone()));
            }
            return Ok(id);
        }
        if self.state.graveyard.contains(id) {
            return Err(ProtocolError::Destroyed { id });
        }
        if let Some(stale) = self.state.by_key.get(&subscription.key).copied() {
            if stale != id {
                self.destroy(stale);
            }
        }
        self.state.by_key.insert(subscription.key.clone(), id);
        self.state.by_id.insert(id, subscription.clone());
        self.events.push(RegistryEvent::Inserted(subscription));
        Ok(id)
    }

    /// Removes `id` and buries it. Returns false if it was not present.
    pub fn destroy(&mut self, id: SubscriptionId) -> bool {
        let Some(subscription) = self.state.by_id.remove(&id) else {
            return false;
        };
        if self.state.by_key.get(&subscription.key) == Some(&id) {
            self.state.by_key.remove(&subscription.key);
        }
        self.state.graveyard.bury(id, subscription.key.clone());
        self.events.push(RegistryEvent::Deleted(id, subscription.key));
        true
    }

    pub fn get(&self, id: SubscriptionId) -> Option<&Subscription> {
        self.state.by_id.get(&id)
    }

    pub fn get_by_key(&self, key: &SubscriptionKey) -> Option<&Subscription> {
        self.state
            .by_key
            .get(key)
            .and_then(|id| self.state.by_id.get(id))
    }

    /// Key of a buried subscription, while the graveyard still remembers it.
    pub fn destroyed_key(&mut self, id: SubscriptionId) -> Option<SubscriptionKey> {
        self.state.graveyard.key_of(id)
    }

    /// True when `id` is live or buried.
    pub fn is_in_use(&mut self, id: SubscriptionId) -> bool {
        self.state.by_id.contains_key(&id) || self.state.graveyard.contains(id)
    }

    pub fn subscriptions(&self, topic: Option<&str>) -> Vec<Subscription> {
        self.state
            .by_id
            .values()
            .filter(|sub| topic.map_or(true, |t| sub.topic() == t))
            .cloned()
            .collect()
    }
}

/// Mirrors replicated subscription entries into the local registry.
///
/// Local writes are skipped: the senior updates its own registry in the same
/// registry-locked step that writes the config map.
pub struct RegistrySync {
    registry: Arc<SubscriptionRegistry>,
}

impl RegistrySync {
    pub fn new(registry: Arc<SubscriptionRegistry>) -> Self {
        Self { registry }
    }
}

impl ConfigListener for RegistrySync {
    fn on_event(&self, event: &ConfigEvent) -> anyhow::Result<()> {
        if event.origin == Origin::Local {
            return Ok(());
        }
        if !matches!(event.key, ConfigKey::Subscription(_)) {
            return Ok(());
        }
        match (event.kind, &event.new, &event.old) {
            (EventKind::Inserted | EventKind::Updated, Some(ConfigValue::Subscription(sub)), _) => {
                if let Err(err) = self.registry.ensure(sub.clone()) {
                    log::debug!("ignoring replicated {}: {err}", sub.key);
                }
            }
            (EventKind::Deleted, _, Some(ConfigValue::Subscription(sub))) => {
                self.registry.destroy(sub.id);
            }
            _ => anyhow::bail!("unexpected value for {:?}", event.key),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::cluster::MemberId;
    use crate::config_map::ConfigMap;
    use crate::model::SubscriberId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingRegistrar {
        registered: AtomicUsize,
        unregistered: AtomicUsize,
    }

    impl Registrar for CountingRegistrar {
        fn register(&self, _subscription: &Subscription) {
            self.registered.fetch_add(1, Ordering::SeqCst);
        }

        fn unregister(&self, _key: &SubscriptionKey, _id: SubscriptionId) {
            self.unregistered.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicking;

    impl SubscriptionListener for Panicking {
        fn on_insert(&self, _subscription: &Subscription) -> anyhow::Result<()> {
            panic!("boom");
        }
    }

    #[derive(Default)]
    struct Deletes(AtomicUsize);

    impl SubscriptionListener for Deletes {
        fn on_insert(&self, _subscription: &Subscription) -> anyhow::Result<()> {
            anyhow::bail!("not interested")
        }

        fn on_delete(&self, _id: SubscriptionId, _key: &SubscriptionKey) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn registry() -> (SubscriptionRegistry, Arc<CountingRegistrar>) {
        let registrar = Arc::new(CountingRegistrar::default());
        let registry = SubscriptionRegistry::new(
            Arc::new(ManualClock::new(0)),
            &ServiceConfig::default(),
            registrar.clone(),
        );
        (registry, registrar)
    }

    fn durable(id: i64) -> Subscription {
        Subscription::new(
            SubscriptionId(id),
            SubscriptionKey::new("orders", SubscriberGroupId::durable("billing")),
            None,
            None,
        )
    }

    #[test]
    fn ensure_is_idempotent_and_registers_once() {
        let (registry, registrar) = registry();
        let mut sub = durable(1);
        assert_eq!(registry.ensure(sub.clone()), Ok(SubscriptionId(1)));
        assert_eq!(registry.ensure(sub.clone()), Ok(SubscriptionId(1)));
        sub.add_subscribers(&[SubscriberId::new(9, MemberId(1))]);
        registry.ensure(sub).unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(SubscriptionId(1)).unwrap().subscribers.len(), 1);
        assert_eq!(registrar.registered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn destroyed_ids_are_buried_and_not_revived() {
        let (registry, registrar) = registry();
        registry.ensure(durable(1)).unwrap();
        assert!(registry.destroy(SubscriptionId(1)));
        assert!(!registry.destroy(SubscriptionId(1)));
        assert!(registry.is_destroyed(SubscriptionId(1)));
        assert_eq!(
            registry.ensure(durable(1)),
            Err(ProtocolError::Destroyed { id: SubscriptionId(1) })
        );
        assert!(registry
            .get_by_key("orders", &SubscriberGroupId::durable("billing"))
            .is_none());
        assert_eq!(registrar.unregistered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn anonymous_groups_are_not_registered() {
        let (registry, registrar) = registry();
        let owner = SubscriberId::new(4, MemberId(2));
        let sub = Subscription::new(
            SubscriptionId(2),
            SubscriptionKey::new("orders", SubscriberGroupId::Anonymous(owner)),
            None,
            None,
        );
        registry.ensure(sub).unwrap();
        registry.destroy(SubscriptionId(2));
        assert_eq!(registrar.registered.load(Ordering::SeqCst), 0);
        assert_eq!(registrar.unregistered.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn listener_failures_are_isolated() {
        let (registry, _) = registry();
        let deletes = Arc::new(Deletes::default());
        registry.add_listener(Arc::new(Panicking));
        registry.add_listener(deletes.clone());

        registry.ensure(durable(1)).unwrap();
        registry.destroy(SubscriptionId(1));
        assert_eq!(deletes.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sync_mirrors_remote_updates_only() {
        let (registry, _) = registry();
        let registry = Arc::new(registry);
        let map = ConfigMap::standalone();
        map.add_listener(Arc::new(RegistrySync::new(registry.clone())));

        map.update_subscription(&durable(1));
        assert!(registry.is_empty());

        map.apply_remote(crate::config_map::ConfigUpdate::Put(
            ConfigKey::Subscription(durable(2).key),
            ConfigValue::Subscription(durable(2)),
        ));
        assert!(registry.get(SubscriptionId(2)).is_some());

        map.apply_remote(crate::config_map::ConfigUpdate::Remove(ConfigKey::Subscription(
            durable(2).key,
        )));
        assert!(registry.is_destroyed(SubscriptionId(2)));
    }
}
