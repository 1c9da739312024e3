//! Per-switch shared session state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU16, AtomicU64, Ordering};

use crate::record::{BincodeCodec, RecordCodec};

/// Shared state of one (pipeline, switching stage) on one node.
///
/// The engine's processing path advances the id high-waters while the
/// synchronization logic runs on another task, so every scalar field is
/// atomic. There is one writer per field at any time; across nodes the
/// state is advanced purely through explicit signals, never shared
/// memory.
#[derive(Debug)]
pub struct SwitchSession {
    last_processed_id: AtomicU64,
    last_emitted_id: AtomicU64,
    head_id: AtomicU64,
    transfer_all: AtomicBool,
    transferring: AtomicBool,
    passive: AtomicBool,
    num_transferred: AtomicU64,
    first_transferred_id: AtomicU64,
    target_port: AtomicU16,
    started_at_ms: AtomicI64,
    codec: Arc<dyn RecordCodec>,
}

impl SwitchSession {
    /// Creates session state with the given record codec.
    #[must_use]
    pub fn new(codec: Arc<dyn RecordCodec>) -> Self {
        Self {
            last_processed_id: AtomicU64::new(0),
            last_emitted_id: AtomicU64::new(0),
            head_id: AtomicU64::new(0),
            transfer_all: AtomicBool::new(false),
            transferring: AtomicBool::new(false),
            passive: AtomicBool::new(false),
            num_transferred: AtomicU64::new(0),
            first_transferred_id: AtomicU64::new(0),
            target_port: AtomicU16::new(0),
            started_at_ms: AtomicI64::new(0),
            codec,
        }
    }

    /// The record codec this stage serializes with.
    #[must_use]
    pub fn codec(&self) -> Arc<dyn RecordCodec> {
        Arc::clone(&self.codec)
    }

    /// Records that the id has been fully processed. Monotonic: a lower
    /// id than the current high-water is ignored.
    pub fn note_processed(&self, id: u64) {
        self.last_processed_id.fetch_max(id, Ordering::AcqRel);
    }

    /// Records that the id has been emitted downstream. Monotonic.
    pub fn note_emitted(&self, id: u64) {
        self.last_emitted_id.fetch_max(id, Ordering::AcqRel);
    }

    /// Id of the last record this node completed processing.
    #[must_use]
    pub fn last_processed_id(&self) -> u64 {
        self.last_processed_id.load(Ordering::Acquire)
    }

    /// Id of the last record this node emitted downstream.
    #[must_use]
    pub fn last_emitted_id(&self) -> u64 {
        self.last_emitted_id.load(Ordering::Acquire)
    }

    /// Head id observed at decision time.
    #[must_use]
    pub fn head_id(&self) -> u64 {
        self.head_id.load(Ordering::Acquire)
    }

    /// Stores the head id driving a partial replay.
    pub fn set_head_id(&self, id: u64) {
        self.head_id.store(id, Ordering::Release);
    }

    /// Whether the whole buffered backlog is being replayed.
    #[must_use]
    pub fn is_transfer_all(&self) -> bool {
        self.transfer_all.load(Ordering::Acquire)
    }

    /// Marks the session as replaying the whole backlog.
    pub fn set_transfer_all(&self, value: bool) {
        self.transfer_all.store(value, Ordering::Release);
    }

    /// Whether a replay is currently in flight for this role.
    #[must_use]
    pub fn is_transferring(&self) -> bool {
        self.transferring.load(Ordering::Acquire)
    }

    /// Marks a replay as in flight (or finished).
    pub fn set_transferring(&self, value: bool) {
        self.transferring.store(value, Ordering::Release);
    }

    /// Whether this operator instance has been silenced.
    #[must_use]
    pub fn is_passive(&self) -> bool {
        self.passive.load(Ordering::Acquire)
    }

    /// Sets the instance's passive disposition.
    pub fn set_passive(&self, value: bool) {
        self.passive.store(value, Ordering::Release);
    }

    /// Number of records the current replay is expected to deliver.
    #[must_use]
    pub fn num_transferred(&self) -> u64 {
        self.num_transferred.load(Ordering::Acquire)
    }

    /// Sets the expected replay count.
    pub fn set_num_transferred(&self, value: u64) {
        self.num_transferred.store(value, Ordering::Release);
    }

    /// Highest id the current partial replay will deliver.
    #[must_use]
    pub fn first_transferred_id(&self) -> u64 {
        self.first_transferred_id.load(Ordering::Acquire)
    }

    /// Sets the highest id the current partial replay will deliver.
    pub fn set_first_transferred_id(&self, value: u64) {
        self.first_transferred_id.store(value, Ordering::Release);
    }

    /// Port of the target instance's transfer receiver.
    #[must_use]
    pub fn target_port(&self) -> u16 {
        self.target_port.load(Ordering::Acquire)
    }

    /// Sets the transfer receiver port for this switch.
    pub fn set_target_port(&self, port: u16) {
        self.target_port.store(port, Ordering::Release);
    }

    /// When the current switch session started, as epoch millis. Zero
    /// outside a session.
    #[must_use]
    pub fn started_at_ms(&self) -> i64 {
        self.started_at_ms.load(Ordering::Acquire)
    }

    /// Stamps the session start time.
    pub fn mark_started(&self) {
        self.started_at_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Release);
    }

    /// Clears the per-switch bookkeeping once a session closes.
    ///
    /// The id high-waters and the passive disposition describe the
    /// operator instance itself, not one switch, and survive the reset.
    pub fn reset(&self) {
        self.head_id.store(0, Ordering::Release);
        self.transfer_all.store(false, Ordering::Release);
        self.transferring.store(false, Ordering::Release);
        self.num_transferred.store(0, Ordering::Release);
        self.first_transferred_id.store(0, Ordering::Release);
        self.target_port.store(0, Ordering::Release);
        self.started_at_ms.store(0, Ordering::Release);
    }

    /// A plain-value view of the current state.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            last_processed_id: self.last_processed_id(),
            last_emitted_id: self.last_emitted_id(),
            head_id: self.head_id(),
            transfer_all: self.is_transfer_all(),
            transferring: self.is_transferring(),
            passive: self.is_passive(),
            num_transferred: self.num_transferred(),
            first_transferred_id: self.first_transferred_id(),
            target_port: self.target_port(),
        }
    }
}

impl Default for SwitchSession {
    fn default() -> Self {
        Self::new(Arc::new(BincodeCodec))
    }
}

/// Point-in-time view of a [`SwitchSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Id of the last record processed by this node.
    pub last_processed_id: u64,
    /// Id of the last record emitted downstream.
    pub last_emitted_id: u64,
    /// Head id observed at decision time.
    pub head_id: u64,
    /// Whether the whole backlog is being replayed.
    pub transfer_all: bool,
    /// Whether a replay is in flight.
    pub transferring: bool,
    /// Whether this instance has been silenced.
    pub passive: bool,
    /// Expected replay count.
    pub num_transferred: u64,
    /// Highest id the partial replay will deliver.
    pub first_transferred_id: u64,
    /// Transfer receiver port for this switch.
    pub target_port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_high_waters_are_monotonic() {
        let session = SwitchSession::default();
        session.note_processed(10);
        session.note_processed(5);
        assert_eq!(session.last_processed_id(), 10);

        session.note_emitted(50);
        session.note_emitted(49);
        assert_eq!(session.last_emitted_id(), 50);
    }

    #[test]
    fn test_reset_clears_switch_bookkeeping() {
        let session = SwitchSession::default();
        session.set_head_id(30);
        session.set_transfer_all(true);
        session.set_transferring(true);
        session.set_num_transferred(19);
        session.set_first_transferred_id(29);
        session.set_target_port(5151);
        session.mark_started();

        session.reset();

        let snap = session.snapshot();
        assert_eq!(snap.head_id, 0);
        assert!(!snap.transfer_all);
        assert!(!snap.transferring);
        assert_eq!(snap.num_transferred, 0);
        assert_eq!(snap.first_transferred_id, 0);
        assert_eq!(snap.target_port, 0);
        assert_eq!(session.started_at_ms(), 0);
    }

    #[test]
    fn test_reset_preserves_instance_state() {
        let session = SwitchSession::default();
        session.note_processed(100);
        session.note_emitted(120);
        session.set_passive(true);

        session.reset();

        assert_eq!(session.last_processed_id(), 100);
        assert_eq!(session.last_emitted_id(), 120);
        assert!(session.is_passive());
    }

    #[test]
    fn test_mark_started_stamps_now() {
        let session = SwitchSession::default();
        assert_eq!(session.started_at_ms(), 0);
        session.mark_started();
        assert!(session.started_at_ms() > 0);
    }

    #[test]
    fn test_snapshot_reflects_fields() {
        let session = SwitchSession::default();
        session.note_processed(10);
        session.set_transferring(true);
        session.set_num_transferred(19);

        let snap = session.snapshot();
        assert_eq!(snap.last_processed_id, 10);
        assert!(snap.transferring);
        assert_eq!(snap.num_transferred, 19);
        assert!(!snap.passive);
    }
}
