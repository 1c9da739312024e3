//! Paired in/out record buffers kept by every pipeline node.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::record::SwitchRecord;

/// The paired FIFO buffers of one operator instance.
///
/// `in` holds records arriving from upstream that await processing;
/// `out` holds records already processed and emitted, retained only to
/// support a possible replay downstream. The engine's processing thread
/// and the synchronization logic access the pair concurrently, so both
/// sides are guarded.
///
/// Draining is irreversible: it is how "already delivered" records are
/// distinguished from "still pending" ones.
#[derive(Debug, Default)]
pub struct QueuePair {
    in_queue: Mutex<VecDeque<SwitchRecord>>,
    out_queue: Mutex<VecDeque<SwitchRecord>>,
}

impl QueuePair {
    /// Creates an empty pair.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a record arriving from upstream.
    pub fn enqueue_in(&self, record: SwitchRecord) {
        self.in_queue.lock().push_back(record);
    }

    /// Appends a processed record retained for replay.
    pub fn enqueue_out(&self, record: SwitchRecord) {
        self.out_queue.lock().push_back(record);
    }

    /// Returns a copy of the oldest pending record, if any.
    #[must_use]
    pub fn peek_in(&self) -> Option<SwitchRecord> {
        self.in_queue.lock().front().cloned()
    }

    /// Removes and returns the oldest pending record, if any.
    #[must_use]
    pub fn poll_in(&self) -> Option<SwitchRecord> {
        self.in_queue.lock().pop_front()
    }

    /// Removes records from the front of the in queue while `pred`
    /// holds, returning how many were removed.
    pub fn drain_in_while(&self, mut pred: impl FnMut(&SwitchRecord) -> bool) -> usize {
        let mut queue = self.in_queue.lock();
        let mut drained = 0;
        while queue.front().is_some_and(&mut pred) {
            queue.pop_front();
            drained += 1;
        }
        drained
    }

    /// Removes records from the front of the out queue while `pred`
    /// holds, returning how many were removed.
    pub fn drain_out_while(&self, mut pred: impl FnMut(&SwitchRecord) -> bool) -> usize {
        let mut queue = self.out_queue.lock();
        let mut drained = 0;
        while queue.front().is_some_and(&mut pred) {
            queue.pop_front();
            drained += 1;
        }
        drained
    }

    /// Discards all pending records.
    pub fn clear_in(&self) {
        self.in_queue.lock().clear();
    }

    /// Discards all retained records.
    pub fn clear_out(&self) {
        self.out_queue.lock().clear();
    }

    /// Discards both buffers.
    pub fn clear(&self) {
        self.clear_in();
        self.clear_out();
    }

    /// Number of pending records.
    #[must_use]
    pub fn in_len(&self) -> usize {
        self.in_queue.lock().len()
    }

    /// Number of retained records.
    #[must_use]
    pub fn out_len(&self) -> usize {
        self.out_queue.lock().len()
    }

    /// Copies the pending records in arrival order.
    #[must_use]
    pub fn snapshot_in(&self) -> Vec<SwitchRecord> {
        self.in_queue.lock().iter().cloned().collect()
    }

    /// Copies the retained records in arrival order.
    #[must_use]
    pub fn snapshot_out(&self) -> Vec<SwitchRecord> {
        self.out_queue.lock().iter().cloned().collect()
    }
}
