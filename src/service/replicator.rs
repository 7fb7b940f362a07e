use std::sync::Arc;

use crate::cluster::{MemberId, MemberRegistry, ProtocolTier};
use crate::config_map::{ConfigKey, ConfigUpdate, ConfigValue, Replicator};
use crate::protocol::{Envelope, Message, Requests};

/// Pushes config map changes to every other member over the transport.
///
/// Subscription entries only go to members that understand subscriptions.
pub struct ClusterReplicator {
    members: Arc<dyn MemberRegistry>,
    requests: Arc<Requests>,
}

impl ClusterReplicator {
    pub fn new(members: Arc<dyn MemberRegistry>, requests: Arc<Requests>) -> Self {
        Self { members, requests }
    }

    fn accepts(&self, member: MemberId, key: &ConfigKey) -> bool {
        match key {
            ConfigKey::Subscription(_) => self
                .members
                .protocol_tier(member)
                .is_some_and(|tier| tier.supports(ProtocolTier::Subscriptions)),
            _ => true,
        }
    }

    fn send(&self, to: MemberId, message: Message) {
        let envelope = Envelope {
            from: self.requests.local_member(),
            id: self.requests.next_id(),
            reply_to: None,
            forwarded: false,
            message,
        };
        if let Err(err) = self.requests.deliver(to, &envelope) {
            log::debug!("replication to {to} dropped: {err}");
        }
    }
}

impl Replicator for ClusterReplicator {
    fn replicate(&self, update: &ConfigUpdate) {
        let local = self.requests.local_member();
        for member in self.members.members() {
            if member != local && self.accepts(member, update.key()) {
                self.send(member, Message::ConfigUpdate(update.clone()));
            }
        }
    }

    fn welcome(&self, to: MemberId, entries: Vec<(ConfigKey, ConfigValue)>) {
        let entries: Vec<_> = entries
            .into_iter()
            .filter(|(key, _)| self.accepts(to, key))
            .collect();
        log::debug!("sending {} config entries to {to}", entries.len());
        self.send(to, Message::Welcome(entries));
    }
}
