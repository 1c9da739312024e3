//! Switch activity counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters for switch activity on one node.
///
/// Incremented from the coordinator, strategy, and transfer tasks;
/// read via [`SwitchMetrics::snapshot`].
#[derive(Debug, Default)]
pub struct SwitchMetrics {
    sessions_started: AtomicU64,
    sessions_completed: AtomicU64,
    sessions_reverted: AtomicU64,
    records_replayed: AtomicU64,
    records_abandoned: AtomicU64,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    signals_sent: AtomicU64,
}

impl SwitchMetrics {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts a switch session starting on this node.
    pub fn record_session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a switch session reaching its terminal state.
    pub fn record_session_completed(&self) {
        self.sessions_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a stalled session force-reverted by the watchdog.
    pub fn record_session_reverted(&self) {
        self.sessions_reverted.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one replayed record landing on this node.
    pub fn record_replayed(&self) {
        self.records_replayed.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts records abandoned under the overload shortcut.
    pub fn record_abandoned(&self, count: u64) {
        self.records_abandoned.fetch_add(count, Ordering::Relaxed);
    }

    /// Counts a transfer frame delivered to the peer.
    pub fn record_frame_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a transfer frame dropped after the reconnect attempt.
    pub fn record_frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a control signal sent by this node.
    pub fn record_signal_sent(&self) {
        self.signals_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// A point-in-time copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> SwitchMetricsSnapshot {
        SwitchMetricsSnapshot {
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_completed: self.sessions_completed.load(Ordering::Relaxed),
            sessions_reverted: self.sessions_reverted.load(Ordering::Relaxed),
            records_replayed: self.records_replayed.load(Ordering::Relaxed),
            records_abandoned: self.records_abandoned.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            signals_sent: self.signals_sent.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`SwitchMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwitchMetricsSnapshot {
    /// Sessions started on this node.
    pub sessions_started: u64,
    /// Sessions that reached a terminal state.
    pub sessions_completed: u64,
    /// Sessions force-reverted by the watchdog.
    pub sessions_reverted: u64,
    /// Replayed records received.
    pub records_replayed: u64,
    /// Records abandoned under overload.
    pub records_abandoned: u64,
    /// Transfer frames delivered.
    pub frames_sent: u64,
    /// Transfer frames dropped.
    pub frames_dropped: u64,
    /// Control signals sent.
    pub signals_sent: u64,
}
