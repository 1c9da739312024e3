//! Switch tunables and their defaults.

use std::time::Duration;

/// Default replay-gap tolerance: gaps (or backlogs) larger than this
/// are abandoned instead of replayed.
pub const DEFAULT_OVERLOAD_SIZE: u64 = 10_000;

/// Default capacity of the transfer sender's frame buffer.
pub const DEFAULT_TRANSFER_BUFFER: usize = 1024;

/// Default connect timeout for the transfer sender.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest transfer frame accepted on either side (1 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1_048_576;

/// Tunables for switch sessions on one node.
#[derive(Debug, Clone)]
pub struct SwitchConfig {
    /// Replay-gap tolerance. A gap between the emission high-water and
    /// the processed floor larger than this, or a retained backlog
    /// larger than this, is abandoned rather than replayed.
    pub overload_size: u64,
    /// Capacity of the transfer sender's frame buffer.
    pub transfer_buffer: usize,
    /// Connect timeout for the transfer sender.
    pub connect_timeout: Duration,
    /// Largest transfer frame accepted.
    pub max_frame_bytes: usize,
    /// Force-revert a session that has not completed within this
    /// window. `None` leaves stalled sessions in place.
    pub session_timeout: Option<Duration>,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            overload_size: DEFAULT_OVERLOAD_SIZE,
            transfer_buffer: DEFAULT_TRANSFER_BUFFER,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            session_timeout: None,
        }
    }
}

impl SwitchConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the replay-gap tolerance.
    #[must_use]
    pub fn with_overload_size(mut self, overload_size: u64) -> Self {
        self.overload_size = overload_size;
        self
    }

    /// Sets the transfer sender's buffer capacity.
    #[must_use]
    pub fn with_transfer_buffer(mut self, capacity: usize) -> Self {
        self.transfer_buffer = capacity;
        self
    }

    /// Sets the transfer sender's connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the largest accepted transfer frame.
    #[must_use]
    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }

    /// Enables the session watchdog with the given window.
    #[must_use]
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }
}
