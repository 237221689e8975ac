use std::time::Duration;

/// Per-channel configuration.
///
/// Passed explicitly to `Channel::open`; there is no process-wide options
/// singleton.
#[derive(Debug, Clone, Copy)]
pub struct ChannelConfig {
    /// How long a delivered message may stay unacknowledged before the
    /// sweep redelivers it.
    pub msg_timeout: Duration,

    /// Resolution of the timeout sweep and of the delivery loop's idle
    /// polling. The sweep wakes early when a new registration may carry an
    /// earlier deadline.
    pub scan_interval: Duration,

    /// Capacity of the delivery handoff. The default of zero gives
    /// rendezvous semantics: a message leaves the delivery loop only when a
    /// consumer is actively receiving, so repositioning discards at most
    /// one pending message.
    pub handoff_capacity: usize,

    /// Whether the canary-skip policy may be enabled on this channel.
    pub allow_canary_skip: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            msg_timeout: Duration::from_secs(60),
            scan_interval: Duration::from_millis(100),
            handoff_capacity: 0,
            allow_canary_skip: false,
        }
    }
}
