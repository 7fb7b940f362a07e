//! Reclaims subscribers of departed members.
//!
//! Runs on the senior only, on its own thread, whenever a member leaves and
//! when this member becomes senior. Each subscription is handled on its own:
//! a failure is recorded in the stats and the scan moves on.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::cluster::{ClusterContext, MemberId};
use crate::config::ServiceConfig;
use crate::coordinator::Coordinator;
use crate::error::Result;
use crate::model::{SubscriberGroupId, SubscriberId, SubscriptionId, SubscriptionKey};
use crate::protocol::{Response, SubscriberIdRequest};

/// Partition whose subscription handler fans an unsubscribe out to every channel.
pub const CANONICAL_PARTITION: u32 = 0;

#[derive(Debug, Clone, Default)]
pub struct CleanupStats {
    /// Subscriptions with at least one departed subscriber or owner.
    pub affected_count: usize,

    /// Departed subscribers removed.
    pub subscribers_removed: usize,

    /// Groups destroyed because nobody was left.
    pub groups_destroyed: usize,

    /// Allocations repaired by the revalidation pass.
    pub reallocated: usize,

    pub errors: Vec<String>,

    pub duration: Duration,

    /// False when the run was skipped because this member is not senior.
    pub ran: bool,
}

impl CleanupStats {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

pub struct DepartureCleanup {
    ctx: ClusterContext,
    config: Arc<ServiceConfig>,
    coordinator: Arc<Coordinator>,
}

impl DepartureCleanup {
    pub fn new(ctx: ClusterContext, config: Arc<ServiceConfig>, coordinator: Arc<Coordinator>) -> Self {
        Self {
            ctx,
            config,
            coordinator,
        }
    }

    /// Runs one pass on a background thread.
    pub fn spawn(self: &Arc<Self>, revalidate: bool) -> Result<JoinHandle<CleanupStats>> {
        let cleanup = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("{}-cleanup", self.config.service_name))
            .spawn(move || cleanup.run_once(revalidate))?;
        Ok(handle)
    }

    pub fn run_once(&self, revalidate: bool) -> CleanupStats {
        let start = Instant::now();
        let mut stats = CleanupStats::default();
        if !self.ctx.members.is_senior() {
            log::debug!("skipping departure cleanup on non-senior {}", self.ctx.local_member());
            return stats;
        }
        stats.ran = true;

        let live = self.ctx.members.members();
        let departed = self.departed_subscribers(&live);
        stats.affected_count = departed.len();

        for (key, (id, gone)) in departed {
            match self.cleanup_subscription(&key, id, &gone) {
                Ok(destroyed) => {
                    stats.subscribers_removed += gone.len();
                    if destroyed {
                        stats.groups_destroyed += 1;
                    }
                }
                Err(err) => {
                    log::warn!("cleanup of departed subscribers in {key} failed: {err}");
                    stats.errors.push(format!("{key}: {err}"));
                }
            }
        }

        if revalidate {
            stats.reallocated = self.coordinator.reallocate(None);
            if stats.reallocated > 0 {
                log::info!("repaired channel allocation of {} subscriptions", stats.reallocated);
            }
        }

        stats.duration = start.elapsed();
        if stats.affected_count > 0 {
            log::info!(
                "departure cleanup removed {} subscribers and {} groups in {:?}",
                stats.subscribers_removed,
                stats.groups_destroyed,
                stats.duration
            );
        }
        stats
    }

    /// Departed subscribers grouped by subscription. Anonymous groups whose
    /// owning member departed appear even with no subscribers left.
    fn departed_subscribers(
        &self,
        live: &BTreeSet<MemberId>,
    ) -> BTreeMap<SubscriptionKey, (SubscriptionId, Vec<SubscriberId>)> {
        let mut departed = BTreeMap::new();
        for subscription in self.coordinator.config_map().subscriptions(None) {
            let gone: Vec<SubscriberId> = subscription
                .subscribers
                .iter()
                .filter(|s| !live.contains(&s.member))
                .copied()
                .collect();
            let orphaned = matches!(
                &subscription.key.group,
                SubscriberGroupId::Anonymous(owner) if !live.contains(&owner.member)
            );
            if !gone.is_empty() || orphaned {
                departed.insert(subscription.key.clone(), (subscription.id, gone));
            }
        }
        departed
    }

    /// Returns true when the whole group was destroyed.
    fn cleanup_subscription(
        &self,
        key: &SubscriptionKey,
        id: SubscriptionId,
        gone: &[SubscriberId],
    ) -> Result<bool> {
        if !gone.is_empty() {
            self.ctx
                .store
                .unsubscribe_all(&key.topic, CANONICAL_PARTITION, key, gone)?;
            let request = SubscriberIdRequest::destroy(&key.topic, id, gone.to_vec());
            if let Response::Failure(err) = self.coordinator.handle_subscriber_id(&request) {
                return Err(err.into());
            }
            log::debug!("removed departed subscribers {gone:?} from {key}");
        }

        let Some(subscription) = self.coordinator.config_map().subscription(key) else {
            return Ok(false);
        };
        let destroy_group = subscription.subscribers.is_empty()
            && (subscription.is_anonymous() || self.config.destroy_empty_durable_groups);
        if !destroy_group {
            return Ok(false);
        }
        let request = SubscriberIdRequest::destroy(&key.topic, subscription.id, Vec::new());
        if let Response::Failure(err) = self.coordinator.handle_subscriber_id(&request) {
            return Err(err.into());
        }
        log::info!("destroyed subscription {} ({key}): no subscribers left", subscription.id);
        Ok(true)
    }
}
