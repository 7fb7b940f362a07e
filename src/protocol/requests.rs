use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::codec;
use super::messages::{Envelope, Message};
use crate::cluster::{MemberId, Transport};
use crate::error::{Error, Result};
use crate::sync::lock;

/// Reply routed back to a waiting caller: the replying member and its message.
pub type Reply = (MemberId, Result<Message>);

struct Pending {
    target: MemberId,
    tx: Sender<Reply>,
}

/// Correlates outbound requests with their replies.
///
/// Callers block on their own channel; the service thread completes entries as
/// replies arrive and fails them when the addressed member departs.
pub struct Requests {
    local: MemberId,
    transport: Arc<dyn Transport>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, Pending>>,
    stopped: AtomicBool,
}

impl Requests {
    pub fn new(local: MemberId, transport: Arc<dyn Transport>) -> Self {
        Self {
            local,
            transport,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn local_member(&self) -> MemberId {
        self.local
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Sends a request whose reply is delivered to `tx`. Returns the request id.
    pub fn send(&self, target: MemberId, message: Message, forwarded: bool, tx: &Sender<Reply>) -> Result<u64> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::ServiceStopped);
        }
        let id = self.next_id();
        lock(&self.pending).insert(
            id,
            Pending {
                target,
                tx: tx.clone(),
            },
        );
        let envelope = Envelope {
            from: self.local,
            id,
            reply_to: None,
            forwarded,
            message,
        };
        if let Err(err) = self.deliver(target, &envelope) {
            lock(&self.pending).remove(&id);
            return Err(err);
        }
        Ok(id)
    }

    /// Fire-and-forget send: replies, replication, welcome snapshots.
    pub fn deliver(&self, target: MemberId, envelope: &Envelope) -> Result<()> {
        let frame = codec::encode(envelope)?;
        self.transport.send(target, frame)
    }

    pub fn reply(&self, to: MemberId, reply_to: u64, message: Message) -> Result<()> {
        let envelope = Envelope {
            from: self.local,
            id: self.next_id(),
            reply_to: Some(reply_to),
            forwarded: false,
            message,
        };
        self.deliver(to, &envelope)
    }

    /// Sends one request and waits for its reply.
    pub fn poll(&self, target: MemberId, message: Message, timeout: Duration) -> Result<Message> {
        let what = message.name();
        let (tx, rx) = mpsc::channel();
        let id = self.send(target, message, false, &tx)?;
        match rx.recv_timeout(timeout) {
            Ok((_, reply)) => reply,
            Err(RecvTimeoutError::Timeout) => {
                self.cancel(id);
                Err(Error::Timeout {
                    what: format!("{what} reply from {target}"),
                    millis: timeout.as_millis() as u64,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(Error::ServiceStopped),
        }
    }

    /// Routes a reply to its waiter. Returns false for unknown ids.
    pub fn complete(&self, reply_to: u64, from: MemberId, message: Message) -> bool {
        let Some(pending) = lock(&self.pending).remove(&reply_to) else {
            return false;
        };
        let _ = pending.tx.send((from, Ok(message)));
        true
    }

    pub fn cancel(&self, id: u64) {
        lock(&self.pending).remove(&id);
    }

    /// Fails every request addressed to `member`.
    pub fn fail_member(&self, member: MemberId) {
        let failed: Vec<Pending> = {
            let mut pending = lock(&self.pending);
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, p)| p.target == member)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };
        for pending in failed {
            let _ = pending.tx.send((member, Err(Error::MemberDeparted(member.0))));
        }
    }

    /// Fails everything and refuses new requests.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let drained: Vec<Pending> = lock(&self.pending).drain().map(|(_, p)| p).collect();
        for pending in drained {
            let _ = pending.tx.send((pending.target, Err(Error::ServiceStopped)));
        }
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }
}
