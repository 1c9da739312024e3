//! In-process signal routing.
//!
//! [`LocalSignalBus`] carries control signals between the coordinators
//! of a single process. Deployments that spread roles across hosts can
//! put any transport behind the same [`SignalSender`] seam; the
//! protocol only sees envelopes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

use sluice_core::{SignalEnvelope, SignalError, SignalSender, SwitchSignal};

type Route = (String, String);

/// Routes signal envelopes to registered `(pipeline, node)` mailboxes.
///
/// Delivery to an unknown route is dropped with a log line rather than
/// failing the sender; signals are advisory and the protocol's retries
/// live above this layer.
#[derive(Default)]
pub struct LocalSignalBus {
    routes: RwLock<HashMap<Route, mpsc::Sender<SignalEnvelope>>>,
}

impl LocalSignalBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a mailbox for `node` on `pipeline`, replacing any
    /// previous registration.
    pub fn register(&self, pipeline: &str, node: &str, tx: mpsc::Sender<SignalEnvelope>) {
        self.routes
            .write()
            .insert((pipeline.to_string(), node.to_string()), tx);
        debug!(pipeline, node, "signal route registered");
    }

    /// Removes the mailbox for `node` on `pipeline`.
    pub fn deregister(&self, pipeline: &str, node: &str) {
        self.routes
            .write()
            .remove(&(pipeline.to_string(), node.to_string()));
        debug!(pipeline, node, "signal route removed");
    }

    /// A sending handle that stamps envelopes with `from`.
    #[must_use]
    pub fn sender(self: &Arc<Self>, from: &str) -> BusSender {
        BusSender {
            bus: Arc::clone(self),
            from: from.to_string(),
        }
    }
}

impl std::fmt::Debug for LocalSignalBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSignalBus")
            .field("routes", &self.routes.read().len())
            .finish()
    }
}

/// A node's sending handle onto a [`LocalSignalBus`].
#[derive(Clone)]
pub struct BusSender {
    bus: Arc<LocalSignalBus>,
    from: String,
}

#[async_trait]
impl SignalSender for BusSender {
    async fn send(
        &self,
        pipeline: &str,
        node: &str,
        signal: SwitchSignal,
    ) -> Result<(), SignalError> {
        let tx = {
            let routes = self.bus.routes.read();
            routes
                .get(&(pipeline.to_string(), node.to_string()))
                .cloned()
        };
        match tx {
            Some(tx) => {
                let envelope = SignalEnvelope {
                    pipeline: pipeline.to_string(),
                    from: self.from.clone(),
                    to: node.to_string(),
                    signal,
                };
                if tx.send(envelope).await.is_err() {
                    debug!(pipeline, node, "signal receiver is gone");
                }
            }
            None => debug!(pipeline, node, "no route for signal"),
        }
        Ok(())
    }
}

impl std::fmt::Debug for BusSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusSender")
            .field("from", &self.from)
            .finish_non_exhaustive()
    }
}
