use realtime_core::ScheduleBackoff;
use std::time::Duration;

/// Connection manager configuration.
#[derive(Debug, Clone)]
pub struct ConnectionManagerConfig {
    /// Delay before each background reconnection attempt.
    pub backoff: ScheduleBackoff,
    /// Wall-clock budget of one reconnection loop, measured from its first attempt.
    pub reconnect_budget: Duration,
    /// Interval between polling attempts once the budget is spent.
    /// `None` leaves the channel in `error` until the next `connect()`.
    pub polling_interval: Option<Duration>,
    /// Longest wait for `open_channel`; clamped to what is left of the budget.
    pub connect_timeout: Duration,
    /// Longest wait for a single `send`.
    pub send_timeout: Duration,
    /// Capacity of each channel's inbound consumer queue.
    pub inbound_capacity: usize,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        Self {
            backoff: ScheduleBackoff::connection_default(),
            reconnect_budget: Duration::from_secs(30),
            polling_interval: Some(Duration::from_secs(30)),
            connect_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(5),
            inbound_capacity: 256,
        }
    }
}
