//! Record emission with in-flight rerouting.
//!
//! [`QueueEmitter`] is the in-process data plane: it delivers records
//! into the input queue registered for the destination node, the way
//! the signal bus delivers envelopes. [`RoutingEmitter`] sits on a
//! producing node's outbound edge and is the point the switch protocol
//! steers: pausing holds records, rerouting changes the peer, and
//! resuming flushes what was held toward the current peer.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use sluice_core::strategy::FlowControl;
use sluice_core::{QueuePair, SwitchRecord, SwitchSession};

/// Destination-addressed record delivery.
#[async_trait]
pub trait RecordEmitter: Send + Sync {
    /// Delivers one record to `node` on `pipeline`.
    async fn emit(&self, pipeline: &str, node: &str, record: SwitchRecord);
}

/// Delivers records into registered input queues.
#[derive(Default)]
pub struct QueueEmitter {
    queues: RwLock<HashMap<(String, String), Arc<QueuePair>>>,
}

impl QueueEmitter {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the input queues for `node` on `pipeline`.
    pub fn register(&self, pipeline: &str, node: &str, queues: Arc<QueuePair>) {
        self.queues
            .write()
            .insert((pipeline.to_string(), node.to_string()), queues);
    }
}

#[async_trait]
impl RecordEmitter for QueueEmitter {
    async fn emit(&self, pipeline: &str, node: &str, record: SwitchRecord) {
        let queues = {
            self.queues
                .read()
                .get(&(pipeline.to_string(), node.to_string()))
                .cloned()
        };
        match queues {
            Some(queues) => queues.enqueue_in(record),
            None => warn!(pipeline, node, id = record.id(), "no queue for record"),
        }
    }
}

impl std::fmt::Debug for QueueEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueEmitter")
            .field("nodes", &self.queues.read().len())
            .finish()
    }
}

struct RouteState {
    peer: String,
    paused: bool,
    held: VecDeque<SwitchRecord>,
}

/// A producing node's steerable outbound edge.
///
/// Every emitted record bumps the session's emission high-water, which
/// is what the preceding role reports when a switch starts.
pub struct RoutingEmitter {
    pipeline: String,
    inner: Arc<dyn RecordEmitter>,
    session: Arc<SwitchSession>,
    state: Mutex<RouteState>,
}

impl RoutingEmitter {
    /// Creates an edge toward `peer`.
    #[must_use]
    pub fn new(
        pipeline: &str,
        peer: &str,
        inner: Arc<dyn RecordEmitter>,
        session: Arc<SwitchSession>,
    ) -> Self {
        Self {
            pipeline: pipeline.to_string(),
            inner,
            session,
            state: Mutex::new(RouteState {
                peer: peer.to_string(),
                paused: false,
                held: VecDeque::new(),
            }),
        }
    }

    /// Emits one record toward the current peer, holding it if the
    /// edge is paused.
    pub async fn emit(&self, record: SwitchRecord) {
        self.session.note_emitted(record.id());
        let deliverable = {
            let mut state = self.state.lock();
            if state.paused {
                state.held.push_back(record);
                None
            } else {
                Some((state.peer.clone(), record))
            }
        };
        if let Some((peer, record)) = deliverable {
            self.inner.emit(&self.pipeline, &peer, record).await;
        }
    }

    /// The node records are currently routed to.
    #[must_use]
    pub fn peer(&self) -> String {
        self.state.lock().peer.clone()
    }

    /// How many records are held while paused.
    #[must_use]
    pub fn held(&self) -> usize {
        self.state.lock().held.len()
    }
}

#[async_trait]
impl FlowControl for RoutingEmitter {
    async fn pause(&self) {
        self.state.lock().paused = true;
        debug!(pipeline = %self.pipeline, "emission paused");
    }

    async fn reroute(&self, _pipeline: &str, node: &str) {
        self.state.lock().peer = node.to_string();
        info!(pipeline = %self.pipeline, peer = node, "emission rerouted");
    }

    async fn resume(&self) {
        let (peer, held) = {
            let mut state = self.state.lock();
            state.paused = false;
            (state.peer.clone(), std::mem::take(&mut state.held))
        };
        if !held.is_empty() {
            debug!(pipeline = %self.pipeline, peer = %peer, count = held.len(), "flushing held records");
        }
        for record in held {
            self.inner.emit(&self.pipeline, &peer, record).await;
        }
    }
}

impl std::fmt::Debug for RoutingEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RoutingEmitter")
            .field("pipeline", &self.pipeline)
            .field("peer", &state.peer)
            .field("paused", &state.paused)
            .field("held", &state.held.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u64) -> SwitchRecord {
        SwitchRecord::new(id, id.to_be_bytes().to_vec())
    }

    fn edge() -> (Arc<QueueEmitter>, Arc<QueuePair>, Arc<QueuePair>, RoutingEmitter) {
        let emitter = Arc::new(QueueEmitter::new());
        let queue_a = Arc::new(QueuePair::new());
        let queue_b = Arc::new(QueuePair::new());
        emitter.register("pipe", "op-a", Arc::clone(&queue_a));
        emitter.register("pipe", "op-b", Arc::clone(&queue_b));
        let routing = RoutingEmitter::new(
            "pipe",
            "op-a",
            Arc::clone(&emitter) as Arc<dyn RecordEmitter>,
            Arc::new(SwitchSession::default()),
        );
        (emitter, queue_a, queue_b, routing)
    }

    #[tokio::test]
    async fn test_emits_to_current_peer() {
        let (_, queue_a, queue_b, routing) = edge();
        routing.emit(record(1)).await;
        assert_eq!(queue_a.in_len(), 1);
        assert_eq!(queue_b.in_len(), 0);
    }

    #[tokio::test]
    async fn test_emit_bumps_high_water() {
        let session = Arc::new(SwitchSession::default());
        let routing = RoutingEmitter::new(
            "pipe",
            "op-a",
            Arc::new(QueueEmitter::new()) as Arc<dyn RecordEmitter>,
            Arc::clone(&session),
        );
        routing.emit(record(12)).await;
        routing.emit(record(9)).await;
        assert_eq!(session.last_emitted_id(), 12);
    }

    #[tokio::test]
    async fn test_pause_holds_and_resume_flushes_to_new_peer() {
        let (_, queue_a, queue_b, routing) = edge();
        routing.emit(record(1)).await;

        routing.pause().await;
        routing.emit(record(2)).await;
        routing.emit(record(3)).await;
        assert_eq!(routing.held(), 2);
        assert_eq!(queue_a.in_len(), 1);

        routing.reroute("pipe", "op-b").await;
        routing.resume().await;

        assert_eq!(routing.held(), 0);
        assert_eq!(queue_a.in_len(), 1);
        let flushed = queue_b.snapshot_in();
        assert_eq!(
            flushed.iter().map(SwitchRecord::id).collect::<Vec<_>>(),
            vec![2, 3]
        );
    }

    #[tokio::test]
    async fn test_unregistered_destination_drops_record() {
        let emitter = QueueEmitter::new();
        emitter.emit("pipe", "ghost", record(1)).await;
    }

    #[tokio::test]
    async fn test_reroute_redirects_subsequent_records() {
        let (_, queue_a, queue_b, routing) = edge();
        routing.emit(record(1)).await;
        routing.reroute("pipe", "op-b").await;
        routing.emit(record(2)).await;
        assert_eq!(queue_a.snapshot_in().len(), 1);
        assert_eq!(queue_b.snapshot_in().len(), 1);
        assert_eq!(routing.peer(), "op-b");
    }
}
