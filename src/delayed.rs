//! Delayed-message store.
//!
//! Stand-in for the durable delayed-queue engine: messages parked here
//! re-enter their target channel's delivery loop once due. Ordering is by
//! due time per channel; ties resolve in arrival order.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crossbeam_channel::{Sender, TrySendError};

use crate::error::{Error, Result};
use crate::message::{Message, MessageId};

/// Delayed ids live in their own space, well clear of log-assigned ids.
const DELAYED_ID_BASE: u64 = 1 << 32;

struct DelayedEntry {
    due_ns: u64,
    seq: u64,
    msg: Message,
}

impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due_ns == other.due_ns && self.seq == other.seq
    }
}

impl Eq for DelayedEntry {}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Inverted so BinaryHeap pops the earliest due entry first.
        (other.due_ns, other.seq).cmp(&(self.due_ns, self.seq))
    }
}

/// Due-time-ordered store of deferred messages, keyed by target channel.
#[derive(Default)]
pub struct DelayedQueue {
    per_channel: Mutex<HashMap<String, BinaryHeap<DelayedEntry>>>,
    wakers: Mutex<Vec<Sender<()>>>,
    next_seq: AtomicU64,
}

impl DelayedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, BinaryHeap<DelayedEntry>>> {
        self.per_channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Parks a message until its due time. The message must carry delayed
    /// metadata naming its target channel; an unset id is assigned here.
    pub fn put_delay_message(&self, mut msg: Message) -> Result<MessageId> {
        let meta = msg
            .delayed
            .as_ref()
            .ok_or(Error::InvalidMessage("missing delayed metadata"))?;
        let channel = meta.channel.clone();
        let due_ns = meta.due_ns;
        let seq = self.next_seq.fetch_add(1, AtomicOrdering::AcqRel);
        if msg.id == MessageId::default() {
            msg.id = MessageId(DELAYED_ID_BASE + seq);
        }
        let id = msg.id;
        self.lock()
            .entry(channel)
            .or_default()
            .push(DelayedEntry { due_ns, seq, msg });
        self.notify_wakers();
        Ok(id)
    }

    /// Pops the earliest message for `channel` whose due time has passed.
    pub fn pop_due(&self, channel: &str, now_ns: u64) -> Option<Message> {
        let mut per_channel = self.lock();
        let heap = per_channel.get_mut(channel)?;
        if heap.peek().map(|entry| entry.due_ns > now_ns).unwrap_or(true) {
            return None;
        }
        heap.pop().map(|entry| entry.msg)
    }

    /// Due time of the earliest pending message for `channel`.
    pub fn next_due_ns(&self, channel: &str) -> Option<u64> {
        self.lock()
            .get(channel)
            .and_then(|heap| heap.peek())
            .map(|entry| entry.due_ns)
    }

    /// Messages parked for `channel`, due or not.
    pub fn pending_count(&self, channel: &str) -> usize {
        self.lock().get(channel).map(|heap| heap.len()).unwrap_or(0)
    }

    /// Registers a waker signalled whenever a message is parked (a new
    /// entry may carry an earlier due time).
    pub fn register_waker(&self, waker: Sender<()>) {
        self.wakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(waker);
    }

    fn notify_wakers(&self) {
        let mut wakers = self.wakers.lock().unwrap_or_else(PoisonError::into_inner);
        wakers.retain(|waker| !matches!(waker.try_send(()), Err(TrySendError::Disconnected(_))));
    }
}
