use std::collections::HashMap;

use crate::cluster::MemberId;
use crate::protocol::Message;

/// Upper bound on re-sends of one forwarded request before the origin is
/// answered `NotSenior` and retries on its own.
pub const MAX_FORWARD_ATTEMPTS: u32 = 8;

/// A senior request this member relayed and is still waiting on.
#[derive(Debug, Clone)]
pub struct Forward {
    pub origin: MemberId,
    pub origin_id: u64,
    pub message: Message,
    pub target: MemberId,
    pub attempts: u32,
}

/// Forwards keyed by the relay's own request id. Owned by the service thread.
#[derive(Debug, Default)]
pub struct Forwards {
    by_id: HashMap<u64, Forward>,
}

impl Forwards {
    pub fn insert(&mut self, id: u64, forward: Forward) {
        self.by_id.insert(id, forward);
    }

    pub fn take(&mut self, id: u64) -> Option<Forward> {
        self.by_id.remove(&id)
    }

    /// Removes and returns every forward addressed to `member`.
    pub fn take_targeting(&mut self, member: MemberId) -> Vec<Forward> {
        let ids: Vec<u64> = self
            .by_id
            .iter()
            .filter(|(_, f)| f.target == member)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter().filter_map(|id| self.by_id.remove(&id)).collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TopicRequest;

    fn forward(target: u32) -> Forward {
        Forward {
            origin: MemberId(5),
            origin_id: 1,
            message: Message::Topic(TopicRequest::Create { topic: "t".into() }),
            target: MemberId(target),
            attempts: 1,
        }
    }

    #[test]
    fn take_targeting_only_returns_matching() {
        let mut forwards = Forwards::default();
        forwards.insert(1, forward(2));
        forwards.insert(2, forward(3));
        forwards.insert(3, forward(2));
        assert_eq!(forwards.take_targeting(MemberId(2)).len(), 2);
        assert_eq!(forwards.len(), 1);
        assert!(forwards.take(2).is_some());
        assert!(forwards.is_empty());
    }
}
