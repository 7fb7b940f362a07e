use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::clock::Clock;
use crate::model::{SubscriptionId, SubscriptionKey};

/// Recently destroyed subscription ids, bounded by age and count.
///
/// Stale confirmations and retries consult it to answer "destroyed" instead of
/// "unknown". Entries expire after `ttl_ms`; past `capacity` the oldest go first.
pub struct Graveyard {
    clock: Arc<dyn Clock>,
    ttl_ms: u64,
    capacity: usize,
    entries: HashMap<SubscriptionId, (SubscriptionKey, u64)>,
    // (buried_at, id) for expiry and eviction order.
    order: BTreeSet<(u64, SubscriptionId)>,
}

impl Graveyard {
    pub fn new(clock: Arc<dyn Clock>, ttl_ms: u64, capacity: usize) -> Self {
        Self {
            clock,
            ttl_ms,
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: BTreeSet::new(),
        }
    }

    pub fn bury(&mut self, id: SubscriptionId, key: SubscriptionKey) {
        let now = self.clock.now_millis();
        if let Some((_, buried_at)) = self.entries.remove(&id) {
            self.order.remove(&(buried_at, id));
        }
        self.entries.insert(id, (key, now));
        self.order.insert((now, id));
        self.expire(now);
        while self.entries.len() > self.capacity {
            let Some((buried_at, oldest)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
            log::trace!("graveyard full, evicted {oldest} buried at {buried_at}");
        }
    }

    pub fn contains(&mut self, id: SubscriptionId) -> bool {
        self.expire(self.clock.now_millis());
        self.entries.contains_key(&id)
    }

    pub fn key_of(&mut self, id: SubscriptionId) -> Option<SubscriptionKey> {
        self.expire(self.clock.now_millis());
        self.entries.get(&id).map(|(key, _)| key.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn expire(&mut self, now: u64) {
        while let Some(&(buried_at, id)) = self.order.first() {
            if now.saturating_sub(buried_at) < self.ttl_ms {
                break;
            }
            self.order.pop_first();
            self.entries.remove(&id);
        }
    }
}
