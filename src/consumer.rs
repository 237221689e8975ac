//! Consumer capability interface.
//!
//! The channel notifies attached consumers of delivery lifecycle events
//! through this trait; implementations live with the protocol/connection
//! layer, outside this crate.

/// Delivery statistics reported by a consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub client_id: i64,
    pub finish_count: u64,
    pub requeue_count: u64,
    pub timeout_count: u64,
}

/// A competing consumer attached to a channel.
///
/// All methods are notifications; the channel never blocks on a consumer
/// and never calls one while holding internal locks.
pub trait Consumer: Send + Sync {
    fn get_id(&self) -> i64;

    fn pause(&self);
    fn unpause(&self);

    fn timed_out_message(&self);
    fn requeued_message(&self);
    fn finished_message(&self);

    /// The channel was administratively emptied (skip or reposition).
    fn empty(&self);
    /// The channel is closing; no further deliveries will arrive.
    fn exit(&self);

    /// Canary-skip policy toggles, forwarded per consumer.
    fn skip_canary(&self);
    fn unskip_canary(&self);

    fn stats(&self) -> ClientStats;

    /// Diagnostic label for logs.
    fn label(&self) -> String;
}
