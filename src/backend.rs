//! Backend log interface and an in-memory implementation.
//!
//! The channel consumes an append-only log through the `BackendQueue`
//! capability trait; the real on-disk log lives outside this crate.
//! `MemLog` is a faithful in-memory stand-in: offset-addressed records,
//! monotone end markers, head cleanup, and publish wakeups.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossbeam_channel::{Sender, TrySendError};

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::message::{Message, MessageId};

/// Byte offset plus cumulative message count, marking a point in the log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueuePosition {
    pub offset: u64,
    pub count: u64,
}

/// Result of appending to the log. For batched puts, `id`/`offset` refer
/// to the first record and `raw_size`/`disk_size` to the whole batch.
#[derive(Debug, Clone, Copy)]
pub struct PutReceipt {
    pub id: MessageId,
    pub offset: u64,
    pub raw_size: u32,
    pub disk_size: u32,
    pub end: QueuePosition,
}

/// The append-only log a channel consumes from.
pub trait BackendQueue: Send + Sync {
    fn put_message(&self, msg: Message) -> Result<PutReceipt>;
    fn put_messages(&self, msgs: Vec<Message>) -> Result<PutReceipt>;

    /// Oldest readable position (advances as old data is cleaned).
    fn queue_read_start(&self) -> QueuePosition;
    /// Position one past the newest record.
    fn queue_read_end(&self) -> QueuePosition;

    /// Reads the record starting exactly at `pos.offset`. Returns `None`
    /// at the end of the log, `InvalidOffset` for a cleaned or misaligned
    /// position.
    fn read_at(&self, pos: QueuePosition) -> Result<Option<Message>>;

    /// Drops records from the head, retaining at least `max_retained_bytes`
    /// behind the end unless `force`, and never past `retain_from`.
    /// Returns the new read start.
    fn try_clean_old_data(
        &self,
        max_retained_bytes: u64,
        force: bool,
        retain_from: u64,
    ) -> Result<QueuePosition>;

    /// Registers a waker signalled whenever new data is appended.
    fn register_waker(&self, waker: Sender<()>);
}

/// Fixed per-record framing footprint: timestamp + id + attempts.
const RECORD_OVERHEAD: u32 = 26;

struct LogInner {
    records: VecDeque<Message>,
    start: QueuePosition,
    end: QueuePosition,
    next_id: u64,
}

/// In-memory append-only log.
pub struct MemLog {
    inner: Mutex<LogInner>,
    wakers: Mutex<Vec<Sender<()>>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemLog {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl MemLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(LogInner {
                records: VecDeque::new(),
                start: QueuePosition::default(),
                end: QueuePosition::default(),
                next_id: 1,
            }),
            wakers: Mutex::new(Vec::new()),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LogInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify_wakers(&self) {
        let mut wakers = self.wakers.lock().unwrap_or_else(PoisonError::into_inner);
        wakers.retain(|waker| !matches!(waker.try_send(()), Err(TrySendError::Disconnected(_))));
    }

    fn append_locked(&self, inner: &mut LogInner, mut msg: Message) -> PutReceipt {
        if msg.id == MessageId::default() {
            msg.id = MessageId(inner.next_id);
        }
        inner.next_id += 1;
        if msg.timestamp_ns == 0 {
            msg.timestamp_ns = self.clock.now_ns();
        }
        msg.offset = inner.end.offset;
        msg.raw_size = RECORD_OVERHEAD + msg.body.len() as u32;
        msg.cnt_index = inner.end.count + 1;
        let receipt = PutReceipt {
            id: msg.id,
            offset: msg.offset,
            raw_size: msg.raw_size,
            disk_size: msg.raw_size,
            end: QueuePosition {
                offset: msg.end_offset(),
                count: msg.cnt_index,
            },
        };
        inner.end = receipt.end;
        inner.records.push_back(msg);
        receipt
    }
}

impl BackendQueue for MemLog {
    fn put_message(&self, msg: Message) -> Result<PutReceipt> {
        let receipt = {
            let mut inner = self.lock();
            self.append_locked(&mut inner, msg)
        };
        self.notify_wakers();
        Ok(receipt)
    }

    fn put_messages(&self, msgs: Vec<Message>) -> Result<PutReceipt> {
        let mut msgs = msgs.into_iter();
        let first = msgs.next().ok_or(Error::InvalidMessage("empty batch"))?;
        let receipt = {
            let mut inner = self.lock();
            let mut receipt = self.append_locked(&mut inner, first);
            for msg in msgs {
                let next = self.append_locked(&mut inner, msg);
                receipt.raw_size += next.raw_size;
                receipt.disk_size += next.disk_size;
                receipt.end = next.end;
            }
            receipt
        };
        self.notify_wakers();
        Ok(receipt)
    }

    fn queue_read_start(&self) -> QueuePosition {
        self.lock().start
    }

    fn queue_read_end(&self) -> QueuePosition {
        self.lock().end
    }

    fn read_at(&self, pos: QueuePosition) -> Result<Option<Message>> {
        let inner = self.lock();
        if pos.offset >= inner.end.offset {
            return Ok(None);
        }
        if pos.offset < inner.start.offset {
            return Err(Error::InvalidOffset(pos.offset));
        }
        // Records are ordered by offset; find the one starting at pos.
        let mut lo = 0usize;
        let mut hi = inner.records.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if inner.records[mid].offset < pos.offset {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        match inner.records.get(lo) {
            Some(record) if record.offset == pos.offset => Ok(Some(record.clone())),
            _ => Err(Error::InvalidOffset(pos.offset)),
        }
    }

    fn try_clean_old_data(
        &self,
        max_retained_bytes: u64,
        force: bool,
        retain_from: u64,
    ) -> Result<QueuePosition> {
        let mut inner = self.lock();
        let retained_floor = if force {
            inner.end.offset
        } else {
            inner.end.offset.saturating_sub(max_retained_bytes)
        };
        let target = retain_from.min(retained_floor);
        while let Some((front_end, front_cnt)) = inner
            .records
            .front()
            .map(|front| (front.end_offset(), front.cnt_index))
        {
            if front_end > target {
                break;
            }
            inner.records.pop_front();
            inner.start = QueuePosition {
                offset: front_end,
                count: front_cnt,
            };
        }
        Ok(inner.start)
    }

    fn register_waker(&self, waker: Sender<()>) {
        self.wakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(waker);
    }
}
