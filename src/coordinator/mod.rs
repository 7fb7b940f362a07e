//! Senior-only decision logic for subscriptions and topics.
//!
//! Every mutation runs under the registry lock and is written to the config
//! map before the caller gets a reply, so an acknowledged change has always
//! been handed to replication. Replaying a request is harmless: CREATE resolves
//! the existing id and adds nothing twice, DESTROY of a missing subscription
//! succeeds without touching the graveyard again.

pub mod channel_count;

use std::sync::{Arc, Mutex};

use crate::cluster::MemberId;
use crate::config::ServiceConfig;
use crate::config_map::{ConfigKey, ConfigMap, ConfigValue};
use crate::error::ProtocolError;
use crate::model::{ChannelAllocationStrategy, SubscriberId, Subscription, SubscriptionId};
use crate::protocol::{Response, SubscriberAction, SubscriberIdRequest, TopicRequest};
use crate::registry::{RegistryTxn, SubscriptionRegistry};
use crate::sync::lock;
use crate::topics::TopicStore;

const MAX_SEQUENCE: u64 = u32::MAX as u64;

#[derive(Debug, Default)]
struct IdBlock {
    next: u64,
    limit: u64,
}

pub struct Coordinator {
    local: MemberId,
    config: Arc<ServiceConfig>,
    registry: Arc<SubscriptionRegistry>,
    config_map: Arc<ConfigMap>,
    topics: Arc<TopicStore>,
    strategy: Arc<dyn ChannelAllocationStrategy>,
    ids: Mutex<IdBlock>,
}

impl Coordinator {
    pub fn new(
        local: MemberId,
        config: Arc<ServiceConfig>,
        registry: Arc<SubscriptionRegistry>,
        config_map: Arc<ConfigMap>,
        topics: Arc<TopicStore>,
        strategy: Arc<dyn ChannelAllocationStrategy>,
    ) -> Self {
        Self {
            local,
            config,
            registry,
            config_map,
            topics,
            strategy,
            ids: Mutex::new(IdBlock::default()),
        }
    }

    pub fn config_map(&self) -> &Arc<ConfigMap> {
        &self.config_map
    }

    pub fn topics(&self) -> &Arc<TopicStore> {
        &self.topics
    }

    /// Published channel count, or the configured one for unregistered topics.
    pub fn channel_count(&self, topic: &str) -> u32 {
        self.config_map
            .channel_count(topic)
            .unwrap_or_else(|| self.config.channel_count(topic))
    }

    pub fn handle_subscriber_id(&self, request: &SubscriberIdRequest) -> Response {
        let result = match request.action {
            SubscriberAction::Create => self.create(request),
            SubscriberAction::Destroy => self.destroy(request),
            SubscriberAction::Update => self.update(request),
        };
        match result {
            Ok(id) => Response::Success(id.0),
            Err(err) => {
                log::debug!("{:?} on topic {} rejected: {err}", request.action, request.topic);
                Response::Failure(err)
            }
        }
    }

    pub fn handle_topic(&self, request: &TopicRequest) -> Response {
        match request {
            TopicRequest::Create { topic } => {
                let _topics = self.topics.lock();
                let count = match self.config_map.channel_count(topic) {
                    Some(count) => count,
                    None => {
                        let count = self.config.channel_count(topic);
                        self.config_map.set_channel_count(topic, count);
                        log::info!("registered topic {topic} with {count} channels");
                        count
                    }
                };
                Response::Success(count as i64)
            }
            TopicRequest::Destroy { topic } => {
                let removed = self.registry.locked(|txn| {
                    let removed = self.config_map.remove_topic(topic);
                    for sub in &removed {
                        txn.destroy(sub.id);
                    }
                    removed.len()
                });
                log::info!("destroyed topic {topic} and {removed} subscriptions");
                Response::Success(removed as i64)
            }
        }
    }

    fn create(&self, request: &SubscriberIdRequest) -> Result<SubscriptionId, ProtocolError> {
        self.registry.locked(|txn| {
            let channel_count = self.channel_count(&request.topic);
            let (mut subscription, created) = match self.resolve(txn, request)? {
                Some(existing) => (existing, false),
                None => {
                    let key = request.key().ok_or(ProtocolError::Invalid {
                        id: request.subscription_id,
                    })?;
                    let id = self.next_id(txn);
                    log::info!("creating subscription {id} for {key}");
                    (
                        Subscription::new(id, key, request.filter.clone(), request.converter.clone()),
                        true,
                    )
                }
            };

            // Requests naming only the id join whatever filter the group has.
            if request.group.is_some() {
                subscription.assert_filter_and_converter(request.filter.as_ref(), request.converter.as_ref())?;
            }

            let added = subscription.add_subscribers(&request.subscribers);
            if added {
                log::debug!(
                    "added subscribers {:?} to subscription {}",
                    request.subscribers,
                    subscription.id
                );
            }
            let reallocated = subscription.update_channel_allocations(self.strategy.as_ref(), channel_count);
            if created || added || reallocated {
                self.persist(txn, subscription.clone())?;
            }
            Ok(subscription.id)
        })
    }

    fn destroy(&self, request: &SubscriberIdRequest) -> Result<SubscriptionId, ProtocolError> {
        self.registry.locked(|txn| {
            let existing = if request.subscription_id.is_unknown() {
                request.key().and_then(|key| txn.get_by_key(&key).cloned())
            } else {
                txn.get(request.subscription_id).cloned()
            };
            let Some(mut subscription) = existing else {
                log::debug!(
                    "destroy of subscription {} on {}: already gone",
                    request.subscription_id,
                    request.topic
                );
                return Ok(request.subscription_id);
            };
            let id = subscription.id;

            if request.subscribers.is_empty() {
                self.config_map.remove_subscription(&subscription.key);
                txn.destroy(id);
                log::info!("destroyed subscription {id} ({})", subscription.key);
                return Ok(id);
            }

            let changed = if request.subscribers.iter().all(SubscriberId::is_null) {
                subscription.remove_all_subscribers()
            } else {
                subscription.remove_subscribers(&request.subscribers)
            };
            if changed {
                let channel_count = self.channel_count(subscription.topic());
                subscription.update_channel_allocations(self.strategy.as_ref(), channel_count);
                log::debug!("removed subscribers {:?} from subscription {id}", request.subscribers);
                self.persist(txn, subscription)?;
            }
            Ok(id)
        })
    }

    fn update(&self, request: &SubscriberIdRequest) -> Result<SubscriptionId, ProtocolError> {
        self.registry.locked(|txn| {
            let mut subscription = self.resolve(txn, request)?.ok_or(ProtocolError::Invalid {
                id: request.subscription_id,
            })?;
            let channel_count = self.channel_count(subscription.topic());
            if subscription.update_channel_allocations(self.strategy.as_ref(), channel_count) {
                self.persist(txn, subscription.clone())?;
            }
            Ok(subscription.id)
        })
    }

    /// Recomputes allocations of every subscription (or one topic's) against
    /// the current channel count. Returns how many changed.
    pub fn reallocate(&self, topic: Option<&str>) -> usize {
        self.registry.locked(|txn| {
            let mut changed = 0;
            for mut subscription in txn.subscriptions(topic) {
                let channel_count = self.channel_count(subscription.topic());
                if !subscription.needs_reallocation(self.strategy.as_ref(), channel_count) {
                    continue;
                }
                subscription.update_channel_allocations(self.strategy.as_ref(), channel_count);
                match self.persist(txn, subscription) {
                    Ok(_) => changed += 1,
                    Err(err) => log::warn!("reallocation skipped: {err}"),
                }
            }
            changed
        })
    }

    /// Existing subscription named by the request. `Ok(None)` only for an
    /// unknown id whose (topic, group) has no subscription yet.
    fn resolve(
        &self,
        txn: &mut RegistryTxn<'_>,
        request: &SubscriberIdRequest,
    ) -> Result<Option<Subscription>, ProtocolError> {
        let id = request.subscription_id;
        if id.is_unknown() {
            let key = request.key().ok_or(ProtocolError::Invalid { id })?;
            return Ok(txn.get_by_key(&key).cloned());
        }
        if let Some(existing) = txn.get(id) {
            return Ok(Some(existing.clone()));
        }
        match txn.destroyed_key(id) {
            Some(key) => {
                log::debug!("subscription {id} ({key}) was already destroyed");
                Err(ProtocolError::Destroyed { id })
            }
            None => Err(ProtocolError::Invalid { id }),
        }
    }

    fn persist(&self, txn: &mut RegistryTxn<'_>, subscription: Subscription) -> Result<SubscriptionId, ProtocolError> {
        self.config_map.update_subscription(&subscription);
        txn.ensure(subscription)
    }

    fn next_id(&self, txn: &mut RegistryTxn<'_>) -> SubscriptionId {
        let mut ids = lock(&self.ids);
        loop {
            if ids.next >= ids.limit {
                self.reserve_block(&mut ids);
            }
            let next = ids.next;
            ids.next += 1;
            let Ok(sequence) = u32::try_from(next) else {
                ids.limit = ids.next;
                continue;
            };
            let id = SubscriptionId::compose(self.local, sequence);
            if !txn.is_in_use(id) {
                return id;
            }
        }
    }

    /// Claims the next id range for this member in the config map, so a
    /// restarted senior never hands out an id it already used.
    fn reserve_block(&self, ids: &mut IdBlock) {
        let key = ConfigKey::Other(format!("subscription-id-block/{}", self.local.0));
        let stored = match self.config_map.get(&key) {
            Some(ConfigValue::Other(value)) => value.as_u64().unwrap_or(1),
            _ => 1,
        };
        let mut start = stored.max(ids.limit).max(1);
        if start > MAX_SEQUENCE {
            log::warn!("subscription id sequence of {} exhausted, wrapping", self.local);
            start = 1;
        }
        let limit = start.saturating_add(self.config.subscription_id_block).min(MAX_SEQUENCE + 1);
        self.config_map
            .put(key, ConfigValue::Other(serde_json::Value::from(limit)));
        log::debug!("reserved subscription ids {start}..{limit} for {}", self.local);
        ids.next = start;
        ids.limit = limit;
    }
}
