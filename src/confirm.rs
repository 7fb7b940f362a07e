//! Cluster-wide confirmation barrier.
//!
//! The requester tracks a mask of partitions that still need confirming and
//! asks each storage member about the partitions it owns. A member clears its
//! partitions only once the change is applied in its own registry or config
//! map. Rounds repeat (re-reading ownership, so moved partitions are asked of
//! their new owner) until the mask is empty or the caller's deadline passes.

use std::collections::HashMap;
use std::fmt;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use crate::cluster::{ClusterContext, MemberId, PartitionSet, ProtocolTier};
use crate::error::{Error, ProtocolError, Result};
use crate::model::{SubscriberId, SubscriptionId};
use crate::protocol::{
    ChannelCountConfirmRequest, Message, PartialValueResponse, Requests, SubscriberConfirmRequest,
};
use crate::registry::SubscriptionRegistry;

/// What the barrier waits for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmSubject {
    /// Subscriber present in the subscription (`NULL`: subscription exists).
    Subscriber {
        id: SubscriptionId,
        subscriber: SubscriberId,
    },
    /// Channel count of the topic at least `channel_count`.
    ChannelCount { topic: String, channel_count: u32 },
}

impl ConfirmSubject {
    fn required_tier(&self) -> ProtocolTier {
        match self {
            ConfirmSubject::Subscriber { .. } => ProtocolTier::Subscriptions,
            ConfirmSubject::ChannelCount { .. } => ProtocolTier::ChannelCount,
        }
    }

    fn request(&self, partitions: PartitionSet) -> Message {
        match self {
            ConfirmSubject::Subscriber { id, subscriber } => Message::SubscriberConfirm(SubscriberConfirmRequest {
                subscription_id: *id,
                subscriber: *subscriber,
                partitions,
            }),
            ConfirmSubject::ChannelCount { topic, channel_count } => {
                Message::ChannelCountConfirm(ChannelCountConfirmRequest {
                    topic: topic.clone(),
                    channel_count: *channel_count,
                    partitions,
                })
            }
        }
    }
}

impl fmt::Display for ConfirmSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfirmSubject::Subscriber { id, subscriber } => {
                write!(f, "subscriber {subscriber} in subscription {id}")
            }
            ConfirmSubject::ChannelCount { topic, channel_count } => {
                write!(f, "channel count {channel_count} of {topic}")
            }
        }
    }
}

/// Storage side of a subscriber confirmation.
pub fn confirm_subscriber(
    registry: &SubscriptionRegistry,
    request: &SubscriberConfirmRequest,
    owned: &PartitionSet,
) -> PartialValueResponse {
    let id = request.subscription_id;
    let mut rejected = request.partitions.clone();
    match registry.get(id) {
        None if registry.is_destroyed(id) => {
            return PartialValueResponse {
                rejected: PartitionSet::empty(rejected.partition_count()),
                error: Some(ProtocolError::Destroyed { id }),
            };
        }
        Some(sub) if request.subscriber.is_null() || sub.has_subscriber(&request.subscriber) => {
            rejected.remove_all(owned);
        }
        // Not replicated here yet.
        _ => {}
    }
    PartialValueResponse { rejected, error: None }
}

/// Storage side of a channel-count confirmation.
pub fn confirm_channel_count(
    local_count: u32,
    request: &ChannelCountConfirmRequest,
    owned: &PartitionSet,
) -> PartialValueResponse {
    let mut rejected = request.partitions.clone();
    if local_count >= request.channel_count {
        rejected.remove_all(owned);
    }
    PartialValueResponse { rejected, error: None }
}

/// Requester side of the barrier; runs on caller threads only.
pub struct Barrier<'a> {
    pub ctx: &'a ClusterContext,
    pub requests: &'a Requests,
    pub retry_interval: Duration,
    pub progress_interval: Duration,
}

impl Barrier<'_> {
    /// Blocks until every partition confirms `subject` or `timeout` passes.
    ///
    /// Succeeds immediately when some storage member predates the protocol
    /// tier the subject needs, or when there are no storage members at all.
    pub fn await_confirmation(&self, subject: &ConfirmSubject, timeout: Duration) -> Result<()> {
        let members = &self.ctx.members;
        if !self.ctx.storage_supports(subject.required_tier()) {
            log::debug!("storage members predate {:?}; assuming {subject} confirmed", subject.required_tier());
            return Ok(());
        }
        if members.storage_members().is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        let deadline = started + timeout;
        let mut last_progress = started;
        let mut remaining = PartitionSet::full(members.partition_count());

        loop {
            let (tx, rx) = mpsc::channel();
            let mut outstanding: HashMap<MemberId, (u64, PartitionSet)> = HashMap::new();
            for member in members.storage_members() {
                let mask = remaining.intersection(&members.owned_partitions(member));
                if mask.is_empty() {
                    continue;
                }
                match self.requests.send(member, subject.request(mask.clone()), false, &tx) {
                    Ok(id) => {
                        outstanding.insert(member, (id, mask));
                    }
                    Err(err) => log::debug!("confirmation of {subject} not sent to {member}: {err}"),
                }
            }

            while !outstanding.is_empty() {
                let now = Instant::now();
                if now >= deadline {
                    return Err(self.timed_out(subject, timeout, outstanding.values().map(|(id, _)| *id)));
                }
                match rx.recv_timeout(deadline - now) {
                    Ok((from, Ok(Message::PartialValue(reply)))) => {
                        let Some((_, mut confirmed)) = outstanding.remove(&from) else {
                            continue;
                        };
                        if let Some(err) = reply.error {
                            remaining.clear();
                            for (id, _) in outstanding.values() {
                                self.requests.cancel(*id);
                            }
                            return Err(err.into());
                        }
                        confirmed.remove_all(&reply.rejected);
                        remaining.remove_all(&confirmed);
                    }
                    Ok((from, Ok(other))) => {
                        log::warn!("unexpected {} from {from} during confirmation", other.name());
                        outstanding.remove(&from);
                    }
                    Ok((from, Err(err))) => {
                        log::debug!("confirmation of {subject} by {from} failed: {err}");
                        outstanding.remove(&from);
                    }
                    Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                        return Err(self.timed_out(subject, timeout, outstanding.values().map(|(id, _)| *id)));
                    }
                }
            }

            if remaining.is_empty() {
                log::trace!("{subject} confirmed in {:?}", started.elapsed());
                return Ok(());
            }

            let now = Instant::now();
            if now.duration_since(last_progress) >= self.progress_interval {
                log::info!(
                    "still waiting for {} partitions to confirm {subject} after {}s",
                    remaining.len(),
                    now.duration_since(started).as_secs()
                );
                last_progress = now;
            }
            if now + self.retry_interval >= deadline {
                return Err(self.timed_out(subject, timeout, std::iter::empty()));
            }
            thread::sleep(self.retry_interval);
        }
    }

    fn timed_out(&self, subject: &ConfirmSubject, timeout: Duration, pending: impl Iterator<Item = u64>) -> Error {
        for id in pending {
            self.requests.cancel(id);
        }
        Error::Timeout {
            what: format!("confirmation of {subject}"),
            millis: timeout.as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::cluster::NoopRegistrar;
    use crate::config::ServiceConfig;
    use crate::model::{SubscriberGroupId, Subscription, SubscriptionKey};
    use std::sync::Arc;

    fn registry() -> SubscriptionRegistry {
        SubscriptionRegistry::new(
            Arc::new(ManualClock::new(0)),
            &ServiceConfig::default(),
            Arc::new(NoopRegistrar),
        )
    }

    fn owned(partitions: &[u32]) -> PartitionSet {
        let mut set = PartitionSet::empty(8);
        for p in partitions {
            set.insert(*p);
        }
        set
    }

    fn request(id: i64, subscriber: SubscriberId) -> SubscriberConfirmRequest {
        SubscriberConfirmRequest {
            subscription_id: SubscriptionId(id),
            subscriber,
            partitions: PartitionSet::full(8),
        }
    }

    #[test]
    fn present_subscriber_clears_owned_partitions() {
        let registry = registry();
        let member = SubscriberId::new(1, MemberId(1));
        let mut sub = Subscription::new(
            SubscriptionId(5),
            SubscriptionKey::new("t", SubscriberGroupId::durable("g")),
            None,
            None,
        );
        sub.add_subscribers(&[member]);
        registry.ensure(sub).unwrap();

        let reply = confirm_subscriber(&registry, &request(5, member), &owned(&[0, 2]));
        assert_eq!(reply.rejected.iter().collect::<Vec<_>>(), vec![1, 3, 4, 5, 6, 7]);
        assert!(reply.error.is_none());

        let other = SubscriberId::new(2, MemberId(1));
        let reply = confirm_subscriber(&registry, &request(5, other), &owned(&[0, 2]));
        assert_eq!(reply.rejected.len(), 8);

        let reply = confirm_subscriber(&registry, &request(5, SubscriberId::NULL), &owned(&[3]));
        assert!(!reply.rejected.contains(3));
    }

    #[test]
    fn unknown_subscription_rejects_everything() {
        let reply = confirm_subscriber(&registry(), &request(9, SubscriberId::NULL), &owned(&[0]));
        assert_eq!(reply.rejected.len(), 8);
        assert!(reply.error.is_none());
    }

    #[test]
    fn destroyed_subscription_reports_error() {
        let registry = registry();
        registry
            .ensure(Subscription::new(
                SubscriptionId(5),
                SubscriptionKey::new("t", SubscriberGroupId::durable("g")),
                None,
                None,
            ))
            .unwrap();
        registry.destroy(SubscriptionId(5));
        let reply = confirm_subscriber(&registry, &request(5, SubscriberId::NULL), &owned(&[0]));
        assert!(reply.rejected.is_empty());
        assert_eq!(reply.error, Some(ProtocolError::Destroyed { id: SubscriptionId(5) }));
    }

    #[test]
    fn channel_count_confirmation() {
        let request = ChannelCountConfirmRequest {
            topic: "orders".into(),
            channel_count: 10,
            partitions: PartitionSet::full(8),
        };
        assert_eq!(confirm_channel_count(6, &request, &owned(&[1])).rejected.len(), 8);
        assert_eq!(confirm_channel_count(10, &request, &owned(&[1])).rejected.len(), 7);
    }
}
