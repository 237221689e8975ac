//! Spillway: delivery and acknowledgment engine for topic-partitioned
//! message logs.
//!
//! A channel is a named, independently-positioned consumer group attached
//! to a topic's append-only log. Spillway delivers each message to exactly
//! one competing consumer at a time, tracks in-flight deliveries with a
//! timeout-based redelivery guarantee, and computes a durable confirmed
//! read position even when acknowledgments arrive out of order. Ordered
//! topics get strict one-outstanding delivery with a policy-gated bypass
//! for synthetic canary traffic, and deferred messages bridge back into
//! the live stream once due.

pub mod backend;
pub mod channel;
pub mod clock;
pub mod config;
pub mod consumer;
pub mod delayed;
pub mod error;
pub mod inflight;
pub mod interval;
pub mod message;

pub use backend::{BackendQueue, MemLog, PutReceipt, QueuePosition};
pub use channel::Channel;
pub use clock::{Clock, ManualClock, QuantaClock, SystemClock};
pub use config::ChannelConfig;
pub use consumer::{ClientStats, Consumer};
pub use delayed::DelayedQueue;
pub use error::{Error, Result};
pub use inflight::{InFlightRecord, InFlightRegistry};
pub use interval::{IntervalSet, QueueInterval};
pub use message::{DelayedMeta, ExtHeader, Message, MessageId};
