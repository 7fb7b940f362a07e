//! In-process cluster: every member runs a real [`TopicService`] thread and
//! frames travel between them over channels.
//!
//! The oldest live member is the senior. Partitions are dealt round-robin to
//! storage-enabled members in join order, so ownership moves when one leaves.
//! A paused member keeps its frames queued until resumed, which is how tests
//! model a slow or unresponsive storage member.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{
    ClusterContext, MemberId, MemberRegistry, PartitionSet, ProtocolTier, Registrar, ServiceControl,
    SubscriptionStore, Transport,
};
use crate::clock::{Clock, SystemClock};
use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use crate::model::{SubscriberId, Subscription, SubscriptionId, SubscriptionKey};
use crate::service::{ServiceEvent, TopicService};
use crate::sync::lock;

const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
struct MemberInfo {
    id: MemberId,
    tier: ProtocolTier,
    storage: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct ControlState {
    suspended: bool,
    suspends: usize,
    resumes: usize,
}

#[derive(Default)]
struct ClusterState {
    next_member: u32,
    /// Join order; the first entry is the senior.
    members: Vec<MemberInfo>,
    inboxes: HashMap<MemberId, Sender<ServiceEvent>>,
    paused: HashMap<MemberId, Vec<Vec<u8>>>,
    control: HashMap<MemberId, ControlState>,
    services: HashMap<MemberId, TopicService>,
}

struct ClusterInner {
    state: Mutex<ClusterState>,
    partition_count: u32,
    store: Arc<LocalStore>,
    registrar: Arc<LocalRegistrar>,
}

/// One member's view of the shared cluster state.
struct LocalMember {
    inner: Arc<ClusterInner>,
    id: MemberId,
}

impl MemberRegistry for LocalMember {
    fn local_member(&self) -> MemberId {
        self.id
    }

    fn senior(&self) -> Option<MemberId> {
        lock(&self.inner.state).members.first().map(|m| m.id)
    }

    fn members(&self) -> BTreeSet<MemberId> {
        lock(&self.inner.state).members.iter().map(|m| m.id).collect()
    }

    fn protocol_tier(&self, member: MemberId) -> Option<ProtocolTier> {
        lock(&self.inner.state)
            .members
            .iter()
            .find(|m| m.id == member)
            .map(|m| m.tier)
    }

    fn storage_members(&self) -> BTreeSet<MemberId> {
        lock(&self.inner.state)
            .members
            .iter()
            .filter(|m| m.storage)
            .map(|m| m.id)
            .collect()
    }

    fn owned_partitions(&self, member: MemberId) -> PartitionSet {
        let count = self.inner.partition_count;
        let mut owned = PartitionSet::empty(count);
        let state = lock(&self.inner.state);
        let storage: Vec<MemberId> = state.members.iter().filter(|m| m.storage).map(|m| m.id).collect();
        if let Some(index) = storage.iter().position(|m| *m == member) {
            for partition in (0..count).filter(|p| *p as usize % storage.len() == index) {
                owned.insert(partition);
            }
        }
        owned
    }

    fn partition_count(&self) -> u32 {
        self.inner.partition_count
    }
}

impl Transport for LocalMember {
    fn send(&self, to: MemberId, frame: Vec<u8>) -> Result<()> {
        let mut state = lock(&self.inner.state);
        if let Some(queue) = state.paused.get_mut(&to) {
            queue.push(frame);
            return Ok(());
        }
        let inbox = state.inboxes.get(&to).ok_or(Error::MemberDeparted(to.0))?;
        inbox
            .send(ServiceEvent::Frame(frame))
            .map_err(|_| Error::MemberDeparted(to.0))
    }
}

impl ServiceControl for LocalMember {
    fn is_suspended(&self) -> bool {
        lock(&self.inner.state)
            .control
            .get(&self.id)
            .is_some_and(|c| c.suspended)
    }

    fn suspend(&self) {
        let mut state = lock(&self.inner.state);
        let control = state.control.entry(self.id).or_default();
        control.suspended = true;
        control.suspends += 1;
    }

    fn resume(&self) {
        let mut state = lock(&self.inner.state);
        let control = state.control.entry(self.id).or_default();
        control.suspended = false;
        control.resumes += 1;
    }
}

/// One `unsubscribe_all` issued by departure cleanup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribeCall {
    pub topic: String,
    pub partition: u32,
    pub key: SubscriptionKey,
    pub subscribers: Vec<SubscriberId>,
}

/// Subscription store that records calls and can be made to fail per topic.
#[derive(Debug, Default)]
pub struct LocalStore {
    calls: Mutex<Vec<UnsubscribeCall>>,
    failing: Mutex<BTreeSet<String>>,
}

impl LocalStore {
    pub fn fail_topic(&self, topic: &str) {
        lock(&self.failing).insert(topic.to_string());
    }

    pub fn calls(&self) -> Vec<UnsubscribeCall> {
        lock(&self.calls).clone()
    }
}

impl SubscriptionStore for LocalStore {
    fn unsubscribe_all(
        &self,
        topic: &str,
        partition: u32,
        key: &SubscriptionKey,
        subscribers: &[SubscriberId],
    ) -> Result<()> {
        if lock(&self.failing).contains(topic) {
            return Err(Error::Io(io::Error::other(format!("store for {topic} unavailable"))));
        }
        lock(&self.calls).push(UnsubscribeCall {
            topic: topic.to_string(),
            partition,
            key: key.clone(),
            subscribers: subscribers.to_vec(),
        });
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrarEvent {
    Registered(SubscriptionId),
    Unregistered(SubscriptionId),
}

impl RegistrarEvent {
    pub fn id(&self) -> SubscriptionId {
        match self {
            RegistrarEvent::Registered(id) | RegistrarEvent::Unregistered(id) => *id,
        }
    }
}

/// Registrar shared by every member; records events in arrival order.
#[derive(Debug, Default)]
pub struct LocalRegistrar {
    events: Mutex<Vec<RegistrarEvent>>,
}

impl LocalRegistrar {
    pub fn events(&self) -> Vec<RegistrarEvent> {
        lock(&self.events).clone()
    }

    pub fn events_for(&self, id: SubscriptionId) -> Vec<RegistrarEvent> {
        lock(&self.events).iter().filter(|e| e.id() == id).copied().collect()
    }
}

impl Registrar for LocalRegistrar {
    fn register(&self, subscription: &Subscription) {
        lock(&self.events).push(RegistrarEvent::Registered(subscription.id));
    }

    fn unregister(&self, _key: &SubscriptionKey, id: SubscriptionId) {
        lock(&self.events).push(RegistrarEvent::Unregistered(id));
    }
}

pub struct LocalCluster {
    inner: Arc<ClusterInner>,
    config: ServiceConfig,
    clock: Arc<dyn Clock>,
    join_timeout: Duration,
}

impl LocalCluster {
    pub fn new(partition_count: u32, config: ServiceConfig) -> Self {
        Self {
            inner: Arc::new(ClusterInner {
                state: Mutex::new(ClusterState::default()),
                partition_count,
                store: Arc::new(LocalStore::default()),
                registrar: Arc::new(LocalRegistrar::default()),
            }),
            config,
            clock: Arc::new(SystemClock),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// Starts a member and waits until it is senior or has the config snapshot.
    pub fn start_member(&self, tier: ProtocolTier, storage: bool) -> Result<TopicService> {
        self.start_member_with_config(tier, storage, self.config.clone())
    }

    /// Like [`start_member`](Self::start_member) with a member-specific config.
    pub fn start_member_with_config(
        &self,
        tier: ProtocolTier,
        storage: bool,
        config: ServiceConfig,
    ) -> Result<TopicService> {
        let id = {
            let mut state = lock(&self.inner.state);
            state.next_member += 1;
            MemberId(state.next_member)
        };
        let member = Arc::new(LocalMember {
            inner: Arc::clone(&self.inner),
            id,
        });
        let ctx = ClusterContext {
            members: member.clone(),
            transport: member.clone(),
            control: member,
            store: self.inner.store.clone(),
            registrar: self.inner.registrar.clone(),
        };
        let service = TopicService::start(config, ctx, Arc::clone(&self.clock))?;

        let peers: Vec<Sender<ServiceEvent>> = {
            let mut state = lock(&self.inner.state);
            state.inboxes.insert(id, service.event_sender());
            state.members.push(MemberInfo { id, tier, storage });
            state.services.insert(id, service.clone());
            state.inboxes.values().cloned().collect()
        };
        for peer in peers {
            let _ = peer.send(ServiceEvent::MemberJoined(id));
        }

        service.await_ready(self.join_timeout)?;
        log::info!("{id} joined at {tier:?} (storage: {storage})");
        Ok(service)
    }

    /// Starts `count` current-tier storage members.
    pub fn start_members(&self, count: usize) -> Result<Vec<TopicService>> {
        (0..count)
            .map(|_| self.start_member(ProtocolTier::CURRENT, true))
            .collect()
    }

    /// Removes the member from the cluster, tells the others, then stops it.
    pub fn stop_member(&self, id: MemberId) -> bool {
        let (service, peers) = {
            let mut state = lock(&self.inner.state);
            let Some(index) = state.members.iter().position(|m| m.id == id) else {
                return false;
            };
            state.members.remove(index);
            state.inboxes.remove(&id);
            state.paused.remove(&id);
            let peers: Vec<Sender<ServiceEvent>> = state.inboxes.values().cloned().collect();
            (state.services.remove(&id), peers)
        };
        for peer in peers {
            let _ = peer.send(ServiceEvent::MemberLeft(id));
        }
        if let Some(service) = service {
            service.shutdown();
        }
        log::info!("{id} left");
        true
    }

    /// Holds frames addressed to `id` until [`LocalCluster::resume`].
    pub fn pause(&self, id: MemberId) {
        lock(&self.inner.state).paused.entry(id).or_default();
    }

    pub fn resume(&self, id: MemberId) {
        let mut state = lock(&self.inner.state);
        let Some(queued) = state.paused.remove(&id) else {
            return;
        };
        if let Some(inbox) = state.inboxes.get(&id) {
            for frame in queued {
                let _ = inbox.send(ServiceEvent::Frame(frame));
            }
        }
    }

    /// Delivers a raw frame, bypassing the codec.
    pub fn inject_frame(&self, to: MemberId, frame: Vec<u8>) -> Result<()> {
        let state = lock(&self.inner.state);
        let inbox = state.inboxes.get(&to).ok_or(Error::MemberDeparted(to.0))?;
        inbox
            .send(ServiceEvent::Frame(frame))
            .map_err(|_| Error::MemberDeparted(to.0))
    }

    pub fn senior(&self) -> Option<MemberId> {
        lock(&self.inner.state).members.first().map(|m| m.id)
    }

    pub fn members(&self) -> Vec<MemberId> {
        lock(&self.inner.state).members.iter().map(|m| m.id).collect()
    }

    pub fn service(&self, id: MemberId) -> Option<TopicService> {
        lock(&self.inner.state).services.get(&id).cloned()
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.inner.store
    }

    pub fn registrar(&self) -> &Arc<LocalRegistrar> {
        &self.inner.registrar
    }

    pub fn suspend_count(&self, id: MemberId) -> usize {
        lock(&self.inner.state).control.get(&id).map_or(0, |c| c.suspends)
    }

    pub fn resume_count(&self, id: MemberId) -> usize {
        lock(&self.inner.state).control.get(&id).map_or(0, |c| c.resumes)
    }

    /// Stops every member, newest first.
    pub fn shutdown(&self) {
        for id in self.members().into_iter().rev() {
            self.stop_member(id);
        }
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(cluster: &LocalCluster, id: u32) -> LocalMember {
        LocalMember {
            inner: Arc::clone(&cluster.inner),
            id: MemberId(id),
        }
    }

    fn add(cluster: &LocalCluster, id: u32, storage: bool) {
        lock(&cluster.inner.state).members.push(MemberInfo {
            id: MemberId(id),
            tier: ProtocolTier::CURRENT,
            storage,
        });
    }

    #[test]
    fn partitions_are_dealt_to_storage_members() {
        let cluster = LocalCluster::new(7, ServiceConfig::default());
        add(&cluster, 1, true);
        add(&cluster, 2, false);
        add(&cluster, 3, true);
        let view = member(&cluster, 2);

        assert_eq!(view.senior(), Some(MemberId(1)));
        assert_eq!(view.owned_partitions(MemberId(1)).iter().collect::<Vec<_>>(), vec![0, 2, 4, 6]);
        assert_eq!(view.owned_partitions(MemberId(3)).iter().collect::<Vec<_>>(), vec![1, 3, 5]);
        assert!(view.owned_partitions(MemberId(2)).is_empty());
        lock(&cluster.inner.state).members.clear();
    }

    #[test]
    fn send_to_unknown_member_fails() {
        let cluster = LocalCluster::new(4, ServiceConfig::default());
        let view = member(&cluster, 1);
        assert!(matches!(view.send(MemberId(9), vec![1]), Err(Error::MemberDeparted(9))));
    }

    #[test]
    fn paused_member_queues_frames() {
        let cluster = LocalCluster::new(4, ServiceConfig::default());
        let (tx, rx) = std::sync::mpsc::channel();
        lock(&cluster.inner.state).inboxes.insert(MemberId(2), tx);
        let view = member(&cluster, 1);

        cluster.pause(MemberId(2));
        view.send(MemberId(2), vec![7]).unwrap();
        assert!(rx.try_recv().is_err());

        cluster.resume(MemberId(2));
        assert!(matches!(rx.try_recv(), Ok(ServiceEvent::Frame(frame)) if frame == vec![7]));
        lock(&cluster.inner.state).inboxes.clear();
    }

    #[test]
    fn control_counts_suspensions() {
        let cluster = LocalCluster::new(4, ServiceConfig::default());
        let view = member(&cluster, 1);
        view.suspend();
        assert!(view.is_suspended());
        view.resume();
        assert!(!view.is_suspended());
        assert_eq!(cluster.suspend_count(MemberId(1)), 1);
        assert_eq!(cluster.resume_count(MemberId(1)), 1);
    }
}
