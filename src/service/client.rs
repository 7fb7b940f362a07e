//! Client operations of a [`TopicService`].
//!
//! Mutations travel to the senior as requests addressed to the local member,
//! whose service thread forwards them. The calling thread then waits on the
//! confirmation barrier; the service thread never blocks.

use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::TopicService;
use crate::config::ServiceConfig;
use crate::config_map::ConfigMap;
use crate::confirm::{Barrier, ConfirmSubject};
use crate::error::{Error, ProtocolError, Result};
use crate::model::{
    Converter, Filter, SubscriberGroupId, SubscriberId, Subscription, SubscriptionId, SubscriptionKey,
};
use crate::protocol::{Message, Response, SetChannelCountRequest, SubscriberAction, SubscriberIdRequest, TopicRequest};
use crate::registry::{SubscriptionListener, SubscriptionRegistry};
use crate::topics::{NamedTopic, TopicStore};

fn value(response: Response) -> Result<i64> {
    match response {
        Response::Success(value) => Ok(value),
        Response::Failure(err) => Err(err.into()),
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

impl TopicService {
    pub fn config(&self) -> &ServiceConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.shared.registry
    }

    pub fn config_map(&self) -> &Arc<ConfigMap> {
        &self.shared.config_map
    }

    pub fn add_subscription_listener(&self, listener: Arc<dyn SubscriptionListener>) {
        self.shared.registry.add_listener(listener);
    }

    /// Mints a subscriber id attributed to this member.
    pub fn new_subscriber_id(&self) -> SubscriberId {
        let id = self.shared.next_subscriber.fetch_add(1, Ordering::Relaxed);
        SubscriberId::new(id, self.local_member())
    }

    /// A private group owned by this member; destroyed when the member leaves.
    pub fn anonymous_group(&self) -> SubscriberGroupId {
        SubscriberGroupId::Anonymous(self.new_subscriber_id())
    }

    // ---- topics ----

    /// Returns the cached handle, registering the topic with the senior first
    /// if the config map does not know it yet.
    pub fn ensure_topic(&self, name: &str) -> Result<NamedTopic> {
        let name = TopicStore::normalize(name);
        if self.shared.config_map.topic_info(name).is_none() {
            let request = Message::Topic(TopicRequest::Create {
                topic: name.to_string(),
            });
            let count = value(self.request_senior(request, self.config().request_timeout())?)?;
            log::debug!("topic {name} registered with {count} channels");
        }
        Ok(self.shared.topics.ensure(name))
    }

    pub fn release_topic(&self, name: &str) -> bool {
        self.shared.topics.release(TopicStore::normalize(name))
    }

    /// Removes the topic and all of its subscriptions cluster-wide.
    /// Returns how many subscriptions were destroyed.
    pub fn destroy_topic(&self, name: &str) -> Result<usize> {
        let name = TopicStore::normalize(name);
        self.shared.topics.release(name);
        let request = Message::Topic(TopicRequest::Destroy {
            topic: name.to_string(),
        });
        let removed = value(self.request_senior(request, self.config().request_timeout())?)?;
        Ok(removed.max(0) as usize)
    }

    pub fn topic_names(&self) -> BTreeSet<String> {
        self.shared.config_map.topic_names()
    }

    // ---- subscriptions ----

    pub fn ensure_subscription(
        &self,
        topic: &str,
        group: SubscriberGroupId,
        subscriber: Option<SubscriberId>,
        filter: Option<Filter>,
        converter: Option<Converter>,
    ) -> Result<SubscriptionId> {
        let timeout = self.config().request_timeout();
        self.ensure_subscription_with_timeout(topic, group, subscriber, filter, converter, timeout)
    }

    /// Creates the group if needed, adds `subscriber` (none: group only) and
    /// waits until every partition's storage member has applied it.
    ///
    /// Returns [`SubscriptionId::NOT_COMPATIBLE`] when the senior predates
    /// subscriptions.
    pub fn ensure_subscription_with_timeout(
        &self,
        topic: &str,
        group: SubscriberGroupId,
        subscriber: Option<SubscriberId>,
        filter: Option<Filter>,
        converter: Option<Converter>,
        timeout: Duration,
    ) -> Result<SubscriptionId> {
        let deadline = Instant::now() + timeout;
        let key = SubscriptionKey::new(TopicStore::normalize(topic), group);
        if let Some(existing) = self.shared.registry.get_by_key(&key.topic, &key.group) {
            existing.assert_filter_and_converter(filter.as_ref(), converter.as_ref())?;
        }

        let request = SubscriberIdRequest::create(&key, subscriber.into_iter().collect())
            .with_filter(filter, converter);
        let id = SubscriptionId(value(self.request_senior(Message::SubscriberId(request), timeout)?)?);
        if id.is_not_compatible() {
            log::debug!("senior predates subscriptions; {key} not created");
            return Ok(id);
        }

        let subject = ConfirmSubject::Subscriber {
            id,
            subscriber: subscriber.unwrap_or(SubscriberId::NULL),
        };
        self.barrier().await_confirmation(&subject, remaining(deadline))?;
        Ok(id)
    }

    /// Adds a subscriber to an existing subscription.
    pub fn ensure_subscriber(&self, topic: &str, id: SubscriptionId, subscriber: SubscriberId) -> Result<()> {
        let timeout = self.config().request_timeout();
        let deadline = Instant::now() + timeout;
        let request = SubscriberIdRequest {
            topic: TopicStore::normalize(topic).to_string(),
            group: None,
            subscription_id: id,
            subscribers: vec![subscriber],
            action: SubscriberAction::Create,
            filter: None,
            converter: None,
        };
        let id = SubscriptionId(value(self.request_senior(Message::SubscriberId(request), timeout)?)?);
        if id.is_not_compatible() {
            return Ok(());
        }
        self.barrier()
            .await_confirmation(&ConfirmSubject::Subscriber { id, subscriber }, remaining(deadline))
    }

    /// Removes one subscriber, or the whole subscription when `subscriber` is `None`.
    pub fn destroy_subscription(&self, id: SubscriptionId, subscriber: Option<SubscriberId>) -> Result<()> {
        let topic = self
            .shared
            .registry
            .get(id)
            .map(|sub| sub.key.topic)
            .unwrap_or_default();
        let request = SubscriberIdRequest::destroy(&topic, id, subscriber.into_iter().collect());
        value(self.request_senior(Message::SubscriberId(request), self.config().request_timeout())?)?;
        Ok(())
    }

    pub fn destroy_subscriber_group(&self, topic: &str, name: &str) -> Result<()> {
        let topic = TopicStore::normalize(topic);
        let mut request = SubscriberIdRequest::destroy(topic, SubscriptionId::UNKNOWN, Vec::new());
        request.group = Some(SubscriberGroupId::durable(name));
        value(self.request_senior(Message::SubscriberId(request), self.config().request_timeout())?)?;
        Ok(())
    }

    /// Asks the senior to recompute the subscription's channel allocation.
    pub fn update_subscription(&self, topic: &str, id: SubscriptionId) -> Result<SubscriptionId> {
        let request = SubscriberIdRequest {
            topic: TopicStore::normalize(topic).to_string(),
            group: None,
            subscription_id: id,
            subscribers: Vec::new(),
            action: SubscriberAction::Update,
            filter: None,
            converter: None,
        };
        let id = value(self.request_senior(Message::SubscriberId(request), self.config().request_timeout())?)?;
        Ok(SubscriptionId(id))
    }

    // ---- channel count ----

    pub fn ensure_channel_count(&self, topic: &str, required: u32, total: u32) -> Result<u32> {
        let timeout = self.config().request_timeout();
        self.ensure_channel_count_with_timeout(topic, required, total, timeout)
    }

    /// Raises the topic's channel count to at least `required` (the senior
    /// picks `max(required, total)`) and waits for every storage member to
    /// apply it. Never lowers the count.
    pub fn ensure_channel_count_with_timeout(
        &self,
        topic: &str,
        required: u32,
        total: u32,
        timeout: Duration,
    ) -> Result<u32> {
        let topic = TopicStore::normalize(topic);
        let current = self.channel_count(topic);
        if required <= current {
            return Ok(current);
        }

        let deadline = Instant::now() + timeout;
        let request = Message::SetChannelCount(SetChannelCountRequest {
            topic: topic.to_string(),
            required,
            total,
        });
        let published = value(self.request_senior(request, timeout)?)?;
        if published == SubscriptionId::NOT_COMPATIBLE.0 {
            log::warn!("senior cannot change channel counts; {topic} keeps its configured count");
            return Ok(self.shared.config.channel_count(topic));
        }

        self.await_local_channel_count(topic, required, deadline)?;
        let subject = ConfirmSubject::ChannelCount {
            topic: topic.to_string(),
            channel_count: required,
        };
        self.barrier().await_confirmation(&subject, remaining(deadline))?;
        Ok(self.channel_count(topic))
    }

    fn await_local_channel_count(&self, topic: &str, required: u32, deadline: Instant) -> Result<()> {
        let started = Instant::now();
        let mut last_progress = started;
        loop {
            if self.shared.config_map.channel_count(topic).unwrap_or(0) >= required {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout {
                    what: format!("channel count {required} of {topic}"),
                    millis: deadline.duration_since(started).as_millis() as u64,
                });
            }
            if now.duration_since(last_progress) >= self.config().progress_interval() {
                log::info!("waiting for channel count {required} of {topic} to arrive");
                last_progress = now;
            }
            thread::sleep(self.config().retry_interval());
        }
    }

    // ---- local reads ----

    pub fn channel_count(&self, topic: &str) -> u32 {
        self.shared.coordinator.channel_count(TopicStore::normalize(topic))
    }

    pub fn has_subscription(&self, id: SubscriptionId) -> bool {
        self.shared.registry.get(id).is_some()
    }

    pub fn get_subscription(&self, id: SubscriptionId) -> Option<Subscription> {
        self.shared.registry.get(id)
    }

    pub fn subscription_id(&self, topic: &str, group: &SubscriberGroupId) -> Option<SubscriptionId> {
        self.shared
            .registry
            .get_by_key(TopicStore::normalize(topic), group)
            .map(|sub| sub.id)
    }

    pub fn is_subscription_destroyed(&self, id: SubscriptionId) -> bool {
        self.shared.registry.is_destroyed(id)
    }

    pub fn subscriber_groups(&self, topic: &str) -> BTreeSet<SubscriberGroupId> {
        self.shared.config_map.subscriber_groups(TopicStore::normalize(topic))
    }

    pub fn subscribers(&self, topic: &str, group: &SubscriberGroupId) -> BTreeSet<SubscriberId> {
        self.shared.config_map.subscribers(TopicStore::normalize(topic), group)
    }

    // ---- plumbing ----

    fn barrier(&self) -> Barrier<'_> {
        Barrier {
            ctx: &self.shared.ctx,
            requests: &self.shared.requests,
            retry_interval: self.config().retry_interval(),
            progress_interval: self.config().progress_interval(),
        }
    }

    /// Sends a senior request through the local service thread, retrying
    /// while seniority moves or the relay target departs.
    fn request_senior(&self, message: Message, timeout: Duration) -> Result<Response> {
        let what = message.name();
        let started = Instant::now();
        let deadline = started + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout {
                    what: format!("{what} to the senior"),
                    millis: timeout.as_millis() as u64,
                });
            }
            match self
                .shared
                .requests
                .poll(self.local_member(), message.clone(), deadline - now)
            {
                Ok(Message::Response(Response::Failure(ProtocolError::NotSenior))) => {
                    log::debug!("{what}: senior moved, retrying");
                }
                Ok(Message::Response(response)) => return Ok(response),
                Ok(other) => {
                    log::warn!("{what} answered with {}", other.name());
                    return Err(Error::Corrupt("unexpected reply to a senior request"));
                }
                Err(err @ Error::Timeout { .. }) => return Err(err),
                Err(err) if err.is_retryable() => log::debug!("{what} failed, retrying: {err}"),
                Err(err) => return Err(err),
            }
            thread::sleep(self.config().retry_interval());
        }
    }
}
