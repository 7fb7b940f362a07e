//! Collaborators the topic service consumes from its host cluster.
//!
//! Membership, seniority, partition ownership and message delivery are owned
//! by the surrounding cluster runtime. The traits here are the seams; the
//! in-process [`local::LocalCluster`] implements all of them for tests and the
//! simulator.

pub mod local;
mod member;
mod partition;

use std::collections::BTreeSet;
use std::sync::Arc;

pub use member::{MemberId, ProtocolTier};
pub use partition::PartitionSet;

use crate::error::Result;
use crate::model::{SubscriberId, Subscription, SubscriptionId, SubscriptionKey};

/// Live view of cluster membership.
pub trait MemberRegistry: Send + Sync {
    fn local_member(&self) -> MemberId;

    /// Current leader, if any member is alive.
    fn senior(&self) -> Option<MemberId>;

    fn members(&self) -> BTreeSet<MemberId>;

    /// `None` when the member is unknown (already departed).
    fn protocol_tier(&self, member: MemberId) -> Option<ProtocolTier>;

    /// Members that own partitions of the topic's storage.
    fn storage_members(&self) -> BTreeSet<MemberId>;

    fn owned_partitions(&self, member: MemberId) -> PartitionSet;

    fn partition_count(&self) -> u32;

    fn is_senior(&self) -> bool {
        self.senior() == Some(self.local_member())
    }
}

/// Point-to-point delivery of encoded frames.
pub trait Transport: Send + Sync {
    fn send(&self, to: MemberId, frame: Vec<u8>) -> Result<()>;
}

/// Suspends partition movement on the hosting service.
pub trait ServiceControl: Send + Sync {
    /// True when the service is already fully suspended.
    fn is_suspended(&self) -> bool;
    fn suspend(&self);
    fn resume(&self);
}

/// Storage-side handle on the topic's subscription caches.
pub trait SubscriptionStore: Send + Sync {
    /// Closes `subscribers` on every channel of `key`, fanned out from `partition`.
    fn unsubscribe_all(
        &self,
        topic: &str,
        partition: u32,
        key: &SubscriptionKey,
        subscribers: &[SubscriberId],
    ) -> Result<()>;
}

/// Management registration of durable subscriptions.
pub trait Registrar: Send + Sync {
    fn register(&self, subscription: &Subscription);
    fn unregister(&self, key: &SubscriptionKey, id: SubscriptionId);
}

/// Registrar for hosts without a management layer.
#[derive(Debug, Default)]
pub struct NoopRegistrar;

impl Registrar for NoopRegistrar {
    fn register(&self, _subscription: &Subscription) {}
    fn unregister(&self, _key: &SubscriptionKey, _id: SubscriptionId) {}
}

/// Bundle of collaborators handed to one member's topic service.
#[derive(Clone)]
pub struct ClusterContext {
    pub members: Arc<dyn MemberRegistry>,
    pub transport: Arc<dyn Transport>,
    pub control: Arc<dyn ServiceControl>,
    pub store: Arc<dyn SubscriptionStore>,
    pub registrar: Arc<dyn Registrar>,
}

impl ClusterContext {
    pub fn local_member(&self) -> MemberId {
        self.members.local_member()
    }

    /// True when every storage member runs at least `required`.
    pub fn storage_supports(&self, required: ProtocolTier) -> bool {
        self.members.storage_members().into_iter().all(|member| {
            self.members
                .protocol_tier(member)
                .map_or(true, |tier| tier.supports(required))
        })
    }

    pub fn senior_supports(&self, required: ProtocolTier) -> bool {
        self.members
            .senior()
            .and_then(|senior| self.members.protocol_tier(senior))
            .is_some_and(|tier| tier.supports(required))
    }
}
