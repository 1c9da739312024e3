//! The per-node switch coordinator.
//!
//! Each pipeline node runs one [`SwitchCoordinator`]: a mailbox-driven
//! task that owns at most one switch session at a time. A
//! `SwitchRequested` signal resolves the node's role from the plan and
//! starts a session; every later signal and every replayed record is
//! routed into the session's strategy until the role reaches its
//! terminal state. An optional session timeout reverts a session that
//! stops making progress, so a lost participant cannot wedge the
//! pipeline in a half-switched state.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sluice_core::strategy::{FlowControl, RecordForwarder};
use sluice_core::{
    QueuePair, SignalEnvelope, SignalSender, SwitchConfig, SwitchContext, SwitchError,
    SwitchMetrics, SwitchPlan, SwitchRecord, SwitchRole, SwitchSession, SwitchSignal,
    SwitchStrategy,
};
use sluice_transport::sender::TransferSender;
use sluice_transport::server::{QueueTarget, ReceiverSink};
use sluice_transport::{HostResolver, LocalSignalBus};

const MAILBOX_CAPACITY: usize = 64;

/// One unit of coordinator work.
#[derive(Debug)]
pub enum CoordinatorEvent {
    /// A control signal addressed to this node.
    Signal(SignalEnvelope),
    /// A record arrived over the transfer channel.
    ReplayArrived {
        /// The replayed record's id.
        id: u64,
    },
}

/// Cloneable handle for feeding a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    node: String,
    tx: mpsc::Sender<CoordinatorEvent>,
    cancel: CancellationToken,
}

impl CoordinatorHandle {
    /// Queues a signal envelope for the coordinator.
    pub async fn deliver(&self, envelope: SignalEnvelope) {
        if self
            .tx
            .send(CoordinatorEvent::Signal(envelope))
            .await
            .is_err()
        {
            debug!(node = %self.node, "coordinator mailbox is closed");
        }
    }

    /// Reports a replayed record delivered by the transfer channel.
    pub async fn replay_arrived(&self, id: u64) {
        if self
            .tx
            .send(CoordinatorEvent::ReplayArrived { id })
            .await
            .is_err()
        {
            debug!(node = %self.node, "coordinator mailbox is closed");
        }
    }

    /// Registers this coordinator as `node`'s mailbox on the bus and
    /// pumps envelopes into it.
    pub fn attach(&self, bus: &LocalSignalBus, pipeline: &str) {
        let (tx, mut rx) = mpsc::channel::<SignalEnvelope>(MAILBOX_CAPACITY);
        bus.register(pipeline, &self.node, tx);
        let events = self.tx.clone();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if events.send(CoordinatorEvent::Signal(envelope)).await.is_err() {
                    break;
                }
            }
        });
    }

    /// Asks the coordinator task to stop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for CoordinatorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorHandle")
            .field("node", &self.node)
            .finish_non_exhaustive()
    }
}

/// Mailbox-driven switch participation for one pipeline node.
pub struct SwitchCoordinator {
    node: String,
    session: Arc<SwitchSession>,
    queues: Arc<QueuePair>,
    signals: Arc<dyn SignalSender>,
    resolver: Arc<dyn HostResolver>,
    flow: Option<Arc<dyn FlowControl>>,
    config: SwitchConfig,
    metrics: Arc<SwitchMetrics>,
    tx: mpsc::Sender<CoordinatorEvent>,
    rx: mpsc::Receiver<CoordinatorEvent>,
    cancel: CancellationToken,
    strategy: Option<SwitchStrategy>,
    sender: Option<TransferSender>,
    deadline: Option<Instant>,
}

impl SwitchCoordinator {
    /// Creates a coordinator for `node` over the node's shared state.
    #[must_use]
    pub fn new(
        node: &str,
        session: Arc<SwitchSession>,
        queues: Arc<QueuePair>,
        signals: Arc<dyn SignalSender>,
        resolver: Arc<dyn HostResolver>,
        config: SwitchConfig,
        metrics: Arc<SwitchMetrics>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        Self {
            node: node.to_string(),
            session,
            queues,
            signals,
            resolver,
            flow: None,
            config,
            metrics,
            tx,
            rx,
            cancel: CancellationToken::new(),
            strategy: None,
            sender: None,
            deadline: None,
        }
    }

    /// Wires the flow controller the preceding and end-node roles
    /// steer.
    #[must_use]
    pub fn with_flow(mut self, flow: Arc<dyn FlowControl>) -> Self {
        self.flow = Some(flow);
        self
    }

    /// A handle for feeding this coordinator once it runs.
    #[must_use]
    pub fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle {
            node: self.node.clone(),
            tx: self.tx.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Runs the coordinator until shut down.
    pub async fn run(mut self) {
        info!(node = %self.node, "switch coordinator running");
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                () = deadline_elapsed(self.deadline), if self.deadline.is_some() => {
                    self.force_revert().await;
                }
                event = self.rx.recv() => match event {
                    Some(CoordinatorEvent::Signal(envelope)) => self.on_envelope(envelope).await,
                    Some(CoordinatorEvent::ReplayArrived { id }) => self.on_replay(id).await,
                    None => break,
                }
            }
        }
        if let Some(sender) = self.sender.take() {
            sender.shutdown().await;
        }
        info!(node = %self.node, "switch coordinator stopped");
    }

    /// Spawns [`Self::run`] on the current runtime.
    #[must_use]
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn on_envelope(&mut self, envelope: SignalEnvelope) {
        match envelope.signal {
            SwitchSignal::SwitchRequested(plan) => {
                if let Err(e) = self.start_session(plan).await {
                    warn!(node = %self.node, error = %e, "switch session failed to start");
                }
            }
            signal => {
                let Some(strategy) = self.strategy.as_mut() else {
                    debug!(
                        node = %self.node,
                        signal = signal.name(),
                        from = %envelope.from,
                        "signal outside a switch session"
                    );
                    return;
                };
                match strategy.on_signal(&envelope.from, signal).await {
                    Ok(()) => self.after_step().await,
                    Err(e) => warn!(node = %self.node, error = %e, "signal rejected"),
                }
            }
        }
    }

    async fn start_session(&mut self, plan: SwitchPlan) -> Result<(), SwitchError> {
        if self.strategy.is_some() {
            debug!(node = %self.node, "switch already in progress; request ignored");
            return Ok(());
        }
        let Some(role) = plan.roles.role_of(&self.node) else {
            debug!(
                node = %self.node,
                pipeline = %plan.pipeline,
                "not a participant in this switch"
            );
            return Ok(());
        };
        self.metrics.record_session_started();

        // The replaying instance dials the target's transfer listener.
        let forwarder = if role == SwitchRole::OriginalIntermediary {
            let host = self
                .resolver
                .resolve(&plan.pipeline, &plan.roles.target_intermediary)?;
            let address = format!("{host}:{}", plan.transfer_port);
            let sender = TransferSender::start(address, &self.config, Arc::clone(&self.metrics));
            let forwarder = sender.forwarder(self.session.codec());
            self.sender = Some(sender);
            Some(Arc::new(forwarder) as Arc<dyn RecordForwarder>)
        } else {
            None
        };

        let ctx = SwitchContext {
            node: self.node.clone(),
            session: Arc::clone(&self.session),
            queues: Arc::clone(&self.queues),
            signals: Arc::clone(&self.signals),
            forwarder,
            flow: self.flow.clone(),
            config: self.config.clone(),
            metrics: Arc::clone(&self.metrics),
        };
        let mut strategy = SwitchStrategy::new(role, plan, ctx);
        strategy.begin().await?;
        if let Some(timeout) = self.config.session_timeout {
            self.deadline = Some(Instant::now() + timeout);
        }
        self.strategy = Some(strategy);
        self.after_step().await;
        Ok(())
    }

    async fn on_replay(&mut self, id: u64) {
        let Some(strategy) = self.strategy.as_mut() else {
            debug!(node = %self.node, id, "replayed record outside a switch session");
            return;
        };
        match strategy.on_replay_record().await {
            Ok(()) => self.after_step().await,
            Err(e) => warn!(node = %self.node, error = %e, "replay accounting failed"),
        }
    }

    /// Closes the session once its strategy reaches a terminal state.
    async fn after_step(&mut self) {
        let finished = self
            .strategy
            .as_ref()
            .is_some_and(SwitchStrategy::is_finished);
        if !finished {
            return;
        }
        self.strategy = None;
        self.deadline = None;
        self.metrics.record_session_completed();
        self.session.reset();
        if let Some(sender) = self.sender.take() {
            sender.shutdown().await;
        }
        info!(node = %self.node, "switch session closed");
    }

    /// Abandons a session that outlived the configured timeout and
    /// restores this node's pre-switch posture.
    async fn force_revert(&mut self) {
        self.deadline = None;
        let Some(strategy) = self.strategy.take() else {
            return;
        };
        warn!(
            node = %self.node,
            role = %strategy.role(),
            phase = %strategy.phase(),
            "switch session timed out; reverting"
        );
        self.metrics.record_session_reverted();

        match strategy.role() {
            SwitchRole::Preceding => {
                if let Some(flow) = &self.flow {
                    let plan = strategy.plan();
                    flow.reroute(&plan.pipeline, &plan.roles.original_intermediary)
                        .await;
                    flow.resume().await;
                }
            }
            SwitchRole::EndNode => {
                if let Some(flow) = &self.flow {
                    flow.resume().await;
                }
            }
            SwitchRole::OriginalIntermediary | SwitchRole::TargetIntermediary => {}
        }

        self.session.reset();
        if let Some(sender) = self.sender.take() {
            sender.shutdown().await;
        }
    }
}

impl std::fmt::Debug for SwitchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwitchCoordinator")
            .field("node", &self.node)
            .field("in_session", &self.strategy.is_some())
            .finish_non_exhaustive()
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    if let Some(at) = deadline {
        tokio::time::sleep_until(at).await;
    }
}

/// Routes records received over the transfer channel into a node's
/// buffers and reports each arrival to the coordinator.
///
/// Replayed records bound for the temporary buffer must be consumed
/// before anything already waiting in the general input queue; keeping
/// them in a separate staging pair is what preserves that order.
pub struct ReplaySink {
    general: Arc<QueuePair>,
    staging: Arc<QueuePair>,
    raw: Option<mpsc::Sender<Vec<u8>>>,
    handle: CoordinatorHandle,
}

impl ReplaySink {
    /// Creates a sink over the node's general and staging buffers.
    #[must_use]
    pub fn new(
        general: Arc<QueuePair>,
        staging: Arc<QueuePair>,
        handle: CoordinatorHandle,
    ) -> Self {
        Self {
            general,
            staging,
            raw: None,
            handle,
        }
    }

    /// Wires a channel for raw engine payloads.
    #[must_use]
    pub fn with_raw_channel(mut self, tx: mpsc::Sender<Vec<u8>>) -> Self {
        self.raw = Some(tx);
        self
    }
}

#[async_trait]
impl ReceiverSink for ReplaySink {
    async fn on_switch_record(&self, record: SwitchRecord, target: QueueTarget) {
        let id = record.id();
        match target {
            QueueTarget::Temporary => self.staging.enqueue_in(record),
            QueueTarget::General => self.general.enqueue_in(record),
        }
        self.handle.replay_arrived(id).await;
    }

    async fn on_general_record(&self, payload: Vec<u8>, _target: QueueTarget) {
        match &self.raw {
            Some(tx) => {
                if tx.send(payload).await.is_err() {
                    debug!("raw record receiver is gone");
                }
            }
            None => debug!(bytes = payload.len(), "raw record without a receiver"),
        }
    }
}

impl std::fmt::Debug for ReplaySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplaySink").finish_non_exhaustive()
    }
}
