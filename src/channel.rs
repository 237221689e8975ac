//! Channel: a named, independently-positioned consumer group over a
//! topic's append-only log.
//!
//! The channel owns the consumption side of the broker: a delivery loop
//! reads unconsumed messages from the backend cursor (or the delayed
//! bridge) and publishes them onto a bounded handoff that competing
//! consumers drain; acknowledgments are reconciled out of order through a
//! disjoint-interval set into a monotonically advancing confirmed
//! position; unacknowledged deliveries are redelivered by a periodic
//! timeout sweep.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   read_at(cursor)   ┌───────────────┐
//! │ Backend log  │────────────────────►│ delivery loop │──┐
//! └──────────────┘                     └───────────────┘  │ bounded
//! ┌──────────────┐   pop_due(channel)         ▲           │ handoff
//! │ Delayed queue│────────────────────────────┘           ▼
//! └──────────────┘                                 ┌─────────────┐
//!        ▲            requeue / timeout            │  consumers  │
//!        └─────────────────────────────────────────┤ (competing) │
//!                                                  └─────────────┘
//!              finish ──► IntervalSet ──► confirmed offset advances
//! ```
//!
//! Two narrowly-scoped critical sections guard shared state: one for the
//! confirmed position plus interval set, one inside the in-flight
//! registry. Neither is ever held across the handoff or a consumer
//! callback.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};

use crate::backend::{BackendQueue, QueuePosition};
use crate::clock::{Clock, SystemClock};
use crate::config::ChannelConfig;
use crate::consumer::{ClientStats, Consumer};
use crate::delayed::DelayedQueue;
use crate::error::{Error, Result};
use crate::inflight::{InFlightRecord, InFlightRegistry};
use crate::interval::{IntervalSet, QueueInterval};
use crate::message::{DelayedMeta, Message, MessageId};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ConfirmState {
    confirmed: QueuePosition,
    intervals: IntervalSet,
}

struct ChannelInner {
    topic: String,
    name: String,
    config: ChannelConfig,
    clock: Arc<dyn Clock>,
    backend: Arc<dyn BackendQueue>,
    delayed: Option<Arc<DelayedQueue>>,

    confirm: Mutex<ConfirmState>,
    inflight: InFlightRegistry,
    requeue: Mutex<VecDeque<Message>>,
    clients: Mutex<HashMap<i64, Arc<dyn Consumer>>>,
    cursor: Mutex<QueuePosition>,

    /// Bumped on every repositioning; the delivery loop drops its pending
    /// message when the epoch it read under is gone.
    reader_epoch: AtomicU64,
    /// Publish timestamp of the next message the loop would hand out.
    depth_ts: AtomicU64,
    deferred_from_delay: AtomicI64,

    exiting: AtomicBool,
    paused: AtomicBool,
    ordered: AtomicBool,
    /// Ordered mode: set around a delivery, cleared when the driver allows
    /// the next message through.
    order_blocked: AtomicBool,
    /// Id of the message the order gate is held for; zero when none.
    order_gated_id: AtomicU64,
    skip_canary: AtomicBool,

    handoff_rx: Receiver<Message>,
    loop_wake_tx: Sender<()>,
    loop_wake_rx: Receiver<()>,
    sweep_wake_tx: Sender<()>,
    sweep_wake_rx: Receiver<()>,
}

/// A consumer group attached to a topic's log.
///
/// Owns one delivery-loop worker and one timeout-sweep worker; both stop
/// on [`Channel::close`]. All methods take `&self` and are safe to call
/// from consumer threads.
pub struct Channel {
    inner: Arc<ChannelInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Channel {
    /// Opens a channel positioned at the backend's oldest readable data.
    pub fn open(
        topic: impl Into<String>,
        name: impl Into<String>,
        config: ChannelConfig,
        backend: Arc<dyn BackendQueue>,
        delayed: Option<Arc<DelayedQueue>>,
    ) -> Channel {
        let position = backend.queue_read_start();
        Self::open_at(topic, name, config, backend, delayed, position)
    }

    /// Opens a channel at a previously stored confirmed position.
    ///
    /// The position is clamped into the backend's live range: a confirmed
    /// offset below a cleaned head snaps forward to the read start, and
    /// one past the end snaps back to the end.
    pub fn open_at(
        topic: impl Into<String>,
        name: impl Into<String>,
        config: ChannelConfig,
        backend: Arc<dyn BackendQueue>,
        delayed: Option<Arc<DelayedQueue>>,
        position: QueuePosition,
    ) -> Channel {
        Self::open_with_clock(
            topic,
            name,
            config,
            backend,
            delayed,
            position,
            Arc::new(SystemClock),
        )
    }

    /// Opens a channel with a custom clock source.
    pub fn open_with_clock(
        topic: impl Into<String>,
        name: impl Into<String>,
        config: ChannelConfig,
        backend: Arc<dyn BackendQueue>,
        delayed: Option<Arc<DelayedQueue>>,
        position: QueuePosition,
        clock: Arc<dyn Clock>,
    ) -> Channel {
        let topic = topic.into();
        let name = name.into();
        let start = backend.queue_read_start();
        let end = backend.queue_read_end();
        let confirmed = if position.offset < start.offset {
            start
        } else if position.offset > end.offset {
            end
        } else {
            position
        };

        let (handoff_tx, handoff_rx) = bounded(config.handoff_capacity);
        let (loop_wake_tx, loop_wake_rx) = bounded(1);
        let (sweep_wake_tx, sweep_wake_rx) = bounded(1);
        backend.register_waker(loop_wake_tx.clone());
        if let Some(dq) = &delayed {
            dq.register_waker(loop_wake_tx.clone());
        }

        let inner = Arc::new(ChannelInner {
            topic,
            name,
            config,
            clock,
            backend,
            delayed,
            confirm: Mutex::new(ConfirmState {
                confirmed,
                intervals: IntervalSet::new(),
            }),
            inflight: InFlightRegistry::new(),
            requeue: Mutex::new(VecDeque::new()),
            clients: Mutex::new(HashMap::new()),
            cursor: Mutex::new(confirmed),
            reader_epoch: AtomicU64::new(0),
            depth_ts: AtomicU64::new(0),
            deferred_from_delay: AtomicI64::new(0),
            exiting: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            ordered: AtomicBool::new(false),
            order_blocked: AtomicBool::new(false),
            order_gated_id: AtomicU64::new(0),
            skip_canary: AtomicBool::new(false),
            handoff_rx,
            loop_wake_tx,
            loop_wake_rx,
            sweep_wake_tx,
            sweep_wake_rx,
        });

        let loop_inner = Arc::clone(&inner);
        let delivery = thread::spawn(move || delivery_loop(loop_inner, handoff_tx));
        let sweep_inner = Arc::clone(&inner);
        let sweep = thread::spawn(move || sweep_loop(sweep_inner));

        log::info!(
            "channel {}/{}: opened at {}:{}",
            inner.topic,
            inner.name,
            confirmed.offset,
            confirmed.count
        );
        Channel {
            inner,
            workers: Mutex::new(vec![delivery, sweep]),
        }
    }

    /// Receiver end of the delivery handoff. Clone one per consumer;
    /// each message is received by exactly one of them. Disconnects once
    /// the channel closes and the buffer drains.
    pub fn message_receiver(&self) -> Receiver<Message> {
        self.inner.handoff_rx.clone()
    }

    fn ensure_active(&self) -> Result<()> {
        if self.inner.exiting.load(Ordering::Acquire) {
            Err(Error::Exiting)
        } else {
            Ok(())
        }
    }

    /// Arms (or re-arms) the in-flight timeout for a delivered message.
    /// Re-arming an id already in flight discards the prior deadline.
    pub fn start_in_flight_timeout(
        &self,
        message: Message,
        consumer_id: i64,
        trace_id: &str,
        timeout: Duration,
    ) -> Result<()> {
        self.ensure_active()?;
        let deadline_ns = self.inner.clock.now_ns() + timeout.as_nanos() as u64;
        self.inner
            .inflight
            .start_in_flight_timeout(message, consumer_id, trace_id, deadline_ns);
        self.inner.wake_sweep();
        Ok(())
    }

    /// Acknowledges an in-flight message and feeds its range into the
    /// confirmed-interval set.
    pub fn finish_message(&self, consumer_id: i64, trace_id: &str, id: MessageId) -> Result<()> {
        self.finish_inner(consumer_id, trace_id, id, false)
    }

    /// Like [`Channel::finish_message`] but succeeds silently when the id
    /// is not in flight. Used by administrative skip paths.
    pub fn finish_message_force(
        &self,
        consumer_id: i64,
        trace_id: &str,
        id: MessageId,
    ) -> Result<()> {
        self.finish_inner(consumer_id, trace_id, id, true)
    }

    fn finish_inner(
        &self,
        consumer_id: i64,
        trace_id: &str,
        id: MessageId,
        force: bool,
    ) -> Result<()> {
        self.ensure_active()?;
        let Some(record) = self.inner.inflight.remove(id) else {
            if force {
                return Ok(());
            }
            return Err(Error::UnknownMessage(id));
        };
        if record.consumer_id != consumer_id {
            log::debug!(
                "channel {}/{}: message {} finished by {} but delivered to {} (trace {})",
                self.inner.topic,
                self.inner.name,
                id,
                consumer_id,
                record.consumer_id,
                trace_id,
            );
        }
        self.inner.notify_client(record.consumer_id, |c| c.finished_message());
        self.inner.resolve(&record.message);
        Ok(())
    }

    /// Hands an in-flight message back for redelivery: immediately when
    /// `delay` is zero, otherwise through the delayed-queue bridge.
    pub fn requeue_message(
        &self,
        consumer_id: i64,
        trace_id: &str,
        id: MessageId,
        delay: Duration,
        force: bool,
    ) -> Result<()> {
        self.ensure_active()?;
        let Some(record) = self.inner.inflight.remove(id) else {
            if force {
                return Ok(());
            }
            return Err(Error::UnknownMessage(id));
        };
        log::debug!(
            "channel {}/{}: requeue {} by {} delay {:?} (trace {})",
            self.inner.topic,
            self.inner.name,
            id,
            consumer_id,
            delay,
            trace_id,
        );
        self.inner.notify_client(record.consumer_id, |c| c.requeued_message());
        let mut message = record.message;
        message.attempts = message.attempts.saturating_add(1);
        if delay.is_zero() {
            self.inner.push_requeue(message);
        } else {
            self.inner.divert_to_delayed(message, delay)?;
        }
        self.inner.release_order_gate_for(id);
        self.inner.wake_loop();
        Ok(())
    }

    /// Records an acknowledged range directly. Exposed for drivers that
    /// resolve messages without the in-flight registry.
    pub fn confirm_backend_queue(&self, message: &Message) -> Result<(QueuePosition, bool)> {
        self.ensure_active()?;
        Ok(self.inner.confirm_message(message))
    }

    /// Ordered mode: allows the delivery loop to publish the next message
    /// after the previous one was acknowledged.
    pub fn continue_consume_for_order(&self) {
        self.inner.release_order_gate();
        self.inner.wake_loop();
    }

    /// Resets the read cursor, confirmed position and all transient
    /// delivery state to an arbitrary position. Without `force` the target
    /// must lie inside the backend's valid range.
    pub fn set_consume_offset(&self, offset: u64, count: u64, force: bool) -> Result<()> {
        self.ensure_active()?;
        let start = self.inner.backend.queue_read_start();
        let end = self.inner.backend.queue_read_end();
        if !force && (offset < start.offset || offset > end.offset) {
            return Err(Error::InvalidOffset(offset));
        }
        let target = QueuePosition { offset, count };
        log::info!(
            "channel {}/{}: consume offset set to {}:{}",
            self.inner.topic,
            self.inner.name,
            offset,
            count
        );
        self.inner.reposition(target);
        Ok(())
    }

    /// Advances confirmed state to the current backend end. In-flight
    /// records are abandoned, not redelivered.
    pub fn skip_to_end(&self) -> Result<()> {
        self.ensure_active()?;
        let end = self.inner.backend.queue_read_end();
        log::info!(
            "channel {}/{}: skipped to end {}:{}",
            self.inner.topic,
            self.inner.name,
            end.offset,
            end.count
        );
        self.inner.reposition(end);
        Ok(())
    }

    /// Rewinds the read cursor to the confirmed position, replaying
    /// everything since the last durable acknowledgment. In-flight state
    /// is kept; redelivered ids re-arm by replacement.
    pub fn reset_reader_to_confirmed(&self) -> Result<QueuePosition> {
        self.ensure_active()?;
        let confirmed = lock(&self.inner.confirm).confirmed;
        {
            let mut cursor = lock(&self.inner.cursor);
            *cursor = confirmed;
            self.inner.reader_epoch.fetch_add(1, Ordering::AcqRel);
        }
        self.inner.depth_ts.store(0, Ordering::Release);
        self.inner.release_order_gate();
        self.inner.wake_loop();
        Ok(confirmed)
    }

    pub fn pause(&self) -> Result<()> {
        self.ensure_active()?;
        self.inner.paused.store(true, Ordering::Release);
        for client in self.inner.snapshot_clients() {
            client.pause();
        }
        self.inner.wake_loop();
        Ok(())
    }

    pub fn unpause(&self) -> Result<()> {
        self.ensure_active()?;
        self.inner.paused.store(false, Ordering::Release);
        for client in self.inner.snapshot_clients() {
            client.unpause();
        }
        self.inner.wake_loop();
        Ok(())
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    /// Toggles strict in-order delivery: at most one outstanding message,
    /// released by [`Channel::continue_consume_for_order`].
    pub fn set_ordered(&self, ordered: bool) -> Result<()> {
        self.ensure_active()?;
        self.inner.ordered.store(ordered, Ordering::Release);
        if !ordered {
            self.inner.release_order_gate();
        }
        self.inner.wake_loop();
        Ok(())
    }

    pub fn is_ordered(&self) -> bool {
        self.inner.ordered.load(Ordering::Acquire)
    }

    /// Toggles the canary-skip policy: marked synthetic messages no longer
    /// block the pipeline. A canary already delivered proceeds to its
    /// normal ack/timeout resolution; the policy affects newly-encountered
    /// canaries and the timeout fallback only.
    pub fn set_skip_canary(&self, enabled: bool) -> Result<()> {
        self.ensure_active()?;
        if enabled && !self.inner.config.allow_canary_skip {
            return Err(Error::Unsupported("canary skip not enabled for this channel"));
        }
        self.inner.skip_canary.store(enabled, Ordering::Release);
        for client in self.inner.snapshot_clients() {
            if enabled {
                client.skip_canary();
            } else {
                client.unskip_canary();
            }
        }
        self.inner.wake_loop();
        self.inner.wake_sweep();
        Ok(())
    }

    pub fn is_skipping_canary(&self) -> bool {
        self.inner.skip_canary.load(Ordering::Acquire)
    }

    pub fn add_client(&self, consumer: Arc<dyn Consumer>) -> Result<()> {
        self.ensure_active()?;
        lock(&self.inner.clients).insert(consumer.get_id(), consumer);
        Ok(())
    }

    pub fn remove_client(&self, consumer_id: i64) {
        lock(&self.inner.clients).remove(&consumer_id);
    }

    pub fn client_stats(&self) -> Vec<ClientStats> {
        self.inner
            .snapshot_clients()
            .iter()
            .map(|client| client.stats())
            .collect()
    }

    /// Outstanding backlog: published count minus confirmed count.
    /// Messages parked in the delayed store are excluded (their origin
    /// range is confirmed at divert time).
    pub fn depth(&self) -> u64 {
        let end = self.inner.backend.queue_read_end();
        let confirmed = lock(&self.inner.confirm).confirmed;
        end.count.saturating_sub(confirmed.count)
    }

    /// Publish timestamp of the next message the channel would hand out;
    /// zero when nothing is pending ahead of the confirmed position.
    pub fn depth_timestamp(&self) -> u64 {
        self.inner.depth_ts.load(Ordering::Acquire)
    }

    pub fn confirmed(&self) -> QueuePosition {
        lock(&self.inner.confirm).confirmed
    }

    pub fn channel_end(&self) -> QueuePosition {
        self.inner.backend.queue_read_end()
    }

    /// Delayed messages injected into delivery but not yet resolved.
    pub fn deferred_from_delay(&self) -> i64 {
        self.inner.deferred_from_delay.load(Ordering::Acquire)
    }

    /// Pending delayed-message count for this channel plus the current
    /// deferred counter.
    pub fn delayed_consumed_state(&self) -> (usize, i64) {
        let pending = self
            .inner
            .delayed
            .as_ref()
            .map(|dq| dq.pending_count(&self.inner.name))
            .unwrap_or(0);
        (pending, self.deferred_from_delay())
    }

    /// In-flight lookup and heap sizes (always equal).
    pub fn in_flight_sizes(&self) -> (usize, usize) {
        self.inner.inflight.sizes()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn topic_name(&self) -> &str {
        &self.inner.topic
    }

    pub fn is_exiting(&self) -> bool {
        self.inner.exiting.load(Ordering::Acquire)
    }

    /// One-line diagnostic snapshot for admin surfaces.
    pub fn debug_stats(&self) -> String {
        let end = self.inner.backend.queue_read_end();
        let (confirmed, gaps) = {
            let cs = lock(&self.inner.confirm);
            (cs.confirmed, cs.intervals.len())
        };
        format!(
            "channel {}/{}: confirmed={}:{} end={}:{} depth={} gaps={} inflight={} requeued={} deferred={} paused={} ordered={}",
            self.inner.topic,
            self.inner.name,
            confirmed.offset,
            confirmed.count,
            end.offset,
            end.count,
            end.count.saturating_sub(confirmed.count),
            gaps,
            self.inner.inflight.len(),
            lock(&self.inner.requeue).len(),
            self.deferred_from_delay(),
            self.is_paused(),
            self.is_ordered(),
        )
    }

    /// Closes the channel: stops both workers, closes the handoff,
    /// abandons in-flight state and notifies consumers. Terminal and
    /// idempotent; every later mutating call returns [`Error::Exiting`].
    pub fn close(&self) {
        if self.inner.exiting.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.wake_loop();
        self.inner.wake_sweep();
        for handle in lock(&self.workers).drain(..) {
            let _ = handle.join();
        }
        let abandoned = self.inner.inflight.drain();
        if !abandoned.is_empty() {
            log::info!(
                "channel {}/{}: abandoned {} in-flight messages on close",
                self.inner.topic,
                self.inner.name,
                abandoned.len()
            );
        }
        lock(&self.inner.requeue).clear();
        self.inner.deferred_from_delay.store(0, Ordering::Release);
        for client in self.inner.snapshot_clients() {
            client.exit();
        }
        log::info!("channel {}/{}: closed", self.inner.topic, self.inner.name);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

impl ChannelInner {
    fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::Acquire)
    }

    fn wake_loop(&self) {
        let _ = self.loop_wake_tx.try_send(());
    }

    fn wake_sweep(&self) {
        let _ = self.sweep_wake_tx.try_send(());
    }

    fn release_order_gate(&self) {
        self.order_blocked.store(false, Ordering::Release);
    }

    /// Releases the order gate only when `id` is the message it is held
    /// for, so a stale record's timeout cannot let a second message
    /// through.
    fn release_order_gate_for(&self, id: MessageId) {
        if self.order_gated_id.load(Ordering::Acquire) == id.0 {
            self.release_order_gate();
        }
    }

    fn snapshot_clients(&self) -> Vec<Arc<dyn Consumer>> {
        lock(&self.clients).values().cloned().collect()
    }

    fn notify_client(&self, consumer_id: i64, notify: impl Fn(&dyn Consumer)) {
        let client = lock(&self.clients).get(&consumer_id).cloned();
        if let Some(client) = client {
            notify(client.as_ref());
        }
    }

    fn push_requeue(&self, message: Message) {
        lock(&self.requeue).push_back(message);
        self.wake_loop();
    }

    fn pop_requeued(&self) -> Option<Message> {
        lock(&self.requeue).pop_front()
    }

    fn pop_due_delayed(&self) -> Option<Message> {
        let delayed = self.delayed.as_ref()?;
        let message = delayed.pop_due(&self.name, self.clock.now_ns())?;
        self.deferred_from_delay.fetch_add(1, Ordering::AcqRel);
        Some(message)
    }

    /// Reads the next log record and the reader epoch it was read under.
    /// Cursor and epoch move together under the cursor lock, so a
    /// repositioning cannot strand a message read from the new position.
    fn read_from_log(&self) -> Result<Option<(Message, u64)>> {
        let mut cursor = lock(&self.cursor);
        let epoch = self.reader_epoch.load(Ordering::Acquire);
        match self.backend.read_at(*cursor) {
            Ok(Some(message)) => {
                *cursor = QueuePosition {
                    offset: message.end_offset(),
                    count: message.cnt_index,
                };
                Ok(Some((message, epoch)))
            }
            Ok(None) => Ok(None),
            Err(Error::InvalidOffset(offset)) => {
                // The backend cleaned past our cursor; snap forward.
                let start = self.backend.queue_read_start();
                log::warn!(
                    "channel {}/{}: cursor {} below backend start {}, snapping forward",
                    self.topic,
                    self.name,
                    offset,
                    start.offset
                );
                *cursor = start;
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn next_message(&self) -> Result<Option<(Message, u64)>> {
        if let Some(message) = self.pop_requeued() {
            let epoch = self.reader_epoch.load(Ordering::Acquire);
            return Ok(Some((message, epoch)));
        }
        if let Some(message) = self.pop_due_delayed() {
            let epoch = self.reader_epoch.load(Ordering::Acquire);
            return Ok(Some((message, epoch)));
        }
        self.read_from_log()
    }

    fn idle_timeout(&self) -> Duration {
        let scan = self.config.scan_interval;
        let Some(delayed) = &self.delayed else {
            return scan;
        };
        match delayed.next_due_ns(&self.name) {
            Some(due_ns) => {
                let now_ns = self.clock.now_ns();
                Duration::from_nanos(due_ns.saturating_sub(now_ns)).min(scan)
            }
            None => scan,
        }
    }

    /// Resolves an acknowledged message: delayed-injected messages settle
    /// the deferred counter, log-resident messages feed the interval set.
    fn resolve(&self, message: &Message) {
        if message.delayed.is_some() {
            self.deferred_resolved();
        } else {
            self.confirm_message(message);
        }
    }

    fn deferred_resolved(&self) {
        let _ = self
            .deferred_from_delay
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                if v > 0 {
                    Some(v - 1)
                } else {
                    None
                }
            });
    }

    fn confirm_message(&self, message: &Message) -> (QueuePosition, bool) {
        let mut cs = lock(&self.confirm);
        if message.end_offset() <= cs.confirmed.offset {
            return (cs.confirmed, false);
        }
        if message.offset < cs.confirmed.offset {
            log::warn!(
                "channel {}/{}: ack range {}..{} straddles confirmed offset {}",
                self.topic,
                self.name,
                message.offset,
                message.end_offset(),
                cs.confirmed.offset
            );
            return (cs.confirmed, false);
        }
        let interval = QueueInterval::new(message.offset, message.end_offset(), message.cnt_index);
        if cs.intervals.is_complete_overlap(&interval) {
            return (cs.confirmed, false);
        }
        cs.intervals.add_or_merge(interval);
        let mut advanced = false;
        if let Some(lowest) = cs.intervals.is_lowest_at(cs.confirmed.offset) {
            cs.confirmed = QueuePosition {
                offset: lowest.end,
                count: lowest.end_cnt,
            };
            let confirmed_offset = cs.confirmed.offset;
            cs.intervals.delete_lower(confirmed_offset);
            advanced = true;
            log::debug!(
                "channel {}/{}: confirmed advanced to {}:{}",
                self.topic,
                self.name,
                cs.confirmed.offset,
                cs.confirmed.count
            );
        }
        (cs.confirmed, advanced)
    }

    fn divert_to_delayed(&self, message: Message, delay: Duration) -> Result<()> {
        let Some(delayed) = &self.delayed else {
            log::warn!(
                "channel {}/{}: no delayed queue attached, requeueing immediately",
                self.topic,
                self.name
            );
            self.push_requeue(message);
            return Ok(());
        };
        let due_ns = self.clock.now_ns() + delay.as_nanos() as u64;
        if let Some(meta) = &message.delayed {
            // Already delayed-injected: send it back to the store with a
            // fresh due time; it re-counts on its next injection.
            let mut parked = message.clone();
            parked.delayed = Some(DelayedMeta {
                due_ns,
                ..meta.clone()
            });
            delayed.put_delay_message(parked)?;
            self.deferred_resolved();
            return Ok(());
        }
        let mut parked = message.clone();
        parked.id = MessageId::default();
        parked.delayed = Some(DelayedMeta {
            channel: self.name.clone(),
            due_ns,
            orig_id: message.id,
            orig_offset: message.offset,
        });
        delayed.put_delay_message(parked)?;
        // The outstanding obligation moves to the delayed store; the
        // origin range no longer holds back the confirmed prefix.
        self.confirm_message(&message);
        Ok(())
    }

    fn on_timeout(&self, record: InFlightRecord) {
        let mut message = record.message;
        log::debug!(
            "channel {}/{}: message {} timed out (attempt {}, consumer {})",
            self.topic,
            self.name,
            message.id,
            message.attempts,
            record.consumer_id
        );
        self.notify_client(record.consumer_id, |c| c.timed_out_message());
        let id = message.id;
        if message.is_canary() && self.skip_canary.load(Ordering::Acquire) {
            // A timed-out canary is implicitly resolved under the policy
            // so real traffic is never blocked behind it.
            self.resolve(&message);
        } else {
            message.attempts = message.attempts.saturating_add(1);
            self.push_requeue(message);
        }
        self.release_order_gate_for(id);
        self.wake_loop();
    }

    fn reposition(&self, target: QueuePosition) {
        {
            let mut cs = lock(&self.confirm);
            cs.confirmed = target;
            cs.intervals = IntervalSet::new();
        }
        let abandoned = self.inflight.drain();
        if !abandoned.is_empty() {
            log::debug!(
                "channel {}/{}: dropped {} in-flight messages on reposition",
                self.topic,
                self.name,
                abandoned.len()
            );
        }
        lock(&self.requeue).clear();
        self.deferred_from_delay.store(0, Ordering::Release);
        {
            let mut cursor = lock(&self.cursor);
            *cursor = target;
            self.reader_epoch.fetch_add(1, Ordering::AcqRel);
        }
        self.depth_ts.store(0, Ordering::Release);
        self.release_order_gate();
        for client in self.snapshot_clients() {
            client.empty();
        }
        self.wake_loop();
        self.wake_sweep();
    }
}

fn delivery_loop(inner: Arc<ChannelInner>, handoff_tx: Sender<Message>) {
    let wake_rx = inner.loop_wake_rx.clone();
    'main: loop {
        if inner.is_exiting() {
            break;
        }
        if inner.paused.load(Ordering::Acquire) {
            let _ = wake_rx.recv_timeout(inner.config.scan_interval);
            continue;
        }

        let (message, epoch) = match inner.next_message() {
            Ok(Some(staged)) => staged,
            Ok(None) => {
                inner.depth_ts.store(0, Ordering::Release);
                let _ = wake_rx.recv_timeout(inner.idle_timeout());
                continue;
            }
            Err(err) => {
                log::error!(
                    "channel {}/{}: delivery halted: {err}",
                    inner.topic,
                    inner.name
                );
                break;
            }
        };
        inner.depth_ts.store(message.timestamp_ns, Ordering::Release);

        if message.is_canary() && inner.skip_canary.load(Ordering::Acquire) {
            log::debug!(
                "channel {}/{}: canary {} confirmed without delivery",
                inner.topic,
                inner.name,
                message.id
            );
            inner.resolve(&message);
            continue;
        }

        let ordered = inner.ordered.load(Ordering::Acquire);
        let message_id = message.id;
        if ordered {
            // Gate before the handoff: a fast consumer may acknowledge and
            // release before send_timeout even returns.
            inner.order_gated_id.store(message_id.0, Ordering::Release);
            inner.order_blocked.store(true, Ordering::Release);
        }
        let mut pending = message;
        let mut delivered = false;
        loop {
            if inner.is_exiting() {
                break 'main;
            }
            if inner.reader_epoch.load(Ordering::Acquire) != epoch {
                // Repositioned while waiting for a receiver; the pending
                // message belongs to the discarded cursor. A dropped
                // delayed injection settles its deferred count here, since
                // no ack will ever arrive for it.
                if pending.delayed.is_some() {
                    inner.deferred_resolved();
                }
                break;
            }
            match handoff_tx.send_timeout(pending, inner.config.scan_interval) {
                Ok(()) => {
                    delivered = true;
                    break;
                }
                Err(SendTimeoutError::Timeout(back)) => pending = back,
                Err(SendTimeoutError::Disconnected(back)) => {
                    drop(back);
                    break 'main;
                }
            }
        }

        if ordered {
            if delivered {
                while inner.order_blocked.load(Ordering::Acquire)
                    && !inner.is_exiting()
                    && inner.reader_epoch.load(Ordering::Acquire) == epoch
                {
                    let _ = wake_rx.recv_timeout(inner.config.scan_interval);
                }
            } else {
                inner.release_order_gate();
            }
            inner.order_gated_id.store(0, Ordering::Release);
        }
    }
    log::debug!(
        "channel {}/{}: delivery loop exited",
        inner.topic,
        inner.name
    );
    // handoff_tx drops here, closing the handoff exactly once.
}

fn sweep_loop(inner: Arc<ChannelInner>) {
    let wake_rx = inner.sweep_wake_rx.clone();
    loop {
        if inner.is_exiting() {
            break;
        }
        let now_ns = inner.clock.now_ns();
        for record in inner.inflight.pop_expired(now_ns) {
            inner.on_timeout(record);
        }
        let timeout = match inner.inflight.next_deadline_ns() {
            Some(deadline_ns) => Duration::from_nanos(deadline_ns.saturating_sub(now_ns))
                .min(inner.config.scan_interval),
            None => inner.config.scan_interval,
        };
        let _ = wake_rx.recv_timeout(timeout);
    }
    log::debug!("channel {}/{}: sweep loop exited", inner.topic, inner.name);
}
