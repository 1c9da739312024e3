//! The synchronization state machine shared by all four switch roles.
//!
//! One algorithm skeleton serves the preceding node, both intermediary
//! instances, and the end nodes; the role selects which hooks fire.
//! Phases run `Active → Deciding → Transferring → (Passive | Active)`,
//! and a given role reaches exactly one terminal phase per switch.
//!
//! The deciding role (the target intermediary) reconciles the buffered
//! queue path against the direct transfer path by record id: replay
//! everything, replay the missing prefix, skip what was already
//! processed, or abandon the gap when it exceeds the overload
//! tolerance.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::SwitchConfig;
use crate::error::{SwitchError, TransferError};
use crate::metrics::SwitchMetrics;
use crate::plan::{SwitchPlan, SwitchRole};
use crate::queue::QueuePair;
use crate::record::{ControlFlag, SwitchRecord};
use crate::session::SwitchSession;
use crate::signal::{SignalSender, SwitchSignal};

/// Protocol phase of one role during a switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Normal operation (also the target side's terminal phase).
    Active,
    /// Switch requested; awaiting or computing the replay decision.
    Deciding,
    /// A replay is in flight.
    Transferring,
    /// Silenced (the original side's terminal phase).
    Passive,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Deciding => write!(f, "deciding"),
            Self::Transferring => write!(f, "transferring"),
            Self::Passive => write!(f, "passive"),
        }
    }
}

/// The reconciliation outcome computed by the deciding role.
///
/// Every decision classifies the whole gap `(floor, target]` between
/// the deciding node's processed floor and the reported emission
/// high-water: each id in it is replayed, already covered, or
/// abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecision {
    /// The processed floor is at or past the reported emission
    /// high-water; nothing is missing.
    CaughtUp,
    /// The gap or the retained backlog exceeded the overload
    /// tolerance; the gap is abandoned rather than replayed.
    Overloaded {
        /// Processed floor at decision time.
        floor: u64,
        /// Reported emission high-water.
        target: u64,
    },
    /// Nothing has arrived to compare against; the whole gap is
    /// replayed.
    ReplayAll {
        /// Processed floor at decision time.
        floor: u64,
        /// Reported emission high-water.
        target: u64,
    },
    /// The input buffer starts past the floor; replay only the ids
    /// strictly between the floor and the buffered head.
    ReplayRange {
        /// Processed floor at decision time.
        floor: u64,
        /// Oldest buffered id.
        head: u64,
        /// Reported emission high-water.
        target: u64,
    },
    /// The input buffer starts at or below the floor; stale records
    /// are drained and nothing is missing.
    SkipProcessed {
        /// Processed floor at decision time.
        floor: u64,
        /// Reported emission high-water.
        target: u64,
        /// How many stale records were drained.
        drained: u64,
    },
}

impl SyncDecision {
    /// Ids replayed over the transfer channel, as an inclusive range.
    #[must_use]
    pub fn replayed_range(&self) -> Option<(u64, u64)> {
        match *self {
            Self::ReplayAll { floor, target } if target > floor => Some((floor + 1, target)),
            Self::ReplayRange { floor, head, .. } if head > floor + 1 => {
                Some((floor + 1, head - 1))
            }
            _ => None,
        }
    }

    /// Ids abandoned under the overload shortcut, inclusive.
    #[must_use]
    pub fn abandoned_range(&self) -> Option<(u64, u64)> {
        match *self {
            Self::Overloaded { floor, target } => Some((floor + 1, target)),
            _ => None,
        }
    }

    /// Ids already covered by processing or the input buffer,
    /// inclusive.
    #[must_use]
    pub fn covered_range(&self) -> Option<(u64, u64)> {
        match *self {
            Self::ReplayRange { head, target, .. } if target >= head => Some((head, target)),
            Self::SkipProcessed { floor, target, .. } if target > floor => {
                Some((floor + 1, target))
            }
            _ => None,
        }
    }

    /// How many records the transfer channel is expected to deliver.
    #[must_use]
    pub fn expected_replay(&self) -> u64 {
        match *self {
            Self::ReplayAll { floor, target } => target.saturating_sub(floor),
            Self::ReplayRange { floor, head, .. } => head.saturating_sub(floor + 1),
            _ => 0,
        }
    }
}

/// Flow control over the node's record stream.
///
/// The preceding role steers its emission through this seam; end nodes
/// steer their consumption. Implementations must tolerate repeated
/// calls.
#[async_trait]
pub trait FlowControl: Send + Sync {
    /// Stops moving records.
    async fn pause(&self);

    /// Attaches the stream to a different peer.
    async fn reroute(&self, pipeline: &str, node: &str);

    /// Resumes moving records toward the current peer.
    async fn resume(&self);
}

/// Outbound side of the record transfer channel.
///
/// Forwarding queues frames for a background sender; it must not block
/// on the socket.
#[async_trait]
pub trait RecordForwarder: Send + Sync {
    /// Announces how subsequent frames are to be interpreted.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::ChannelClosed`] if the sender task is
    /// gone.
    async fn forward_flag(&self, flag: ControlFlag) -> Result<(), TransferError>;

    /// Queues one record for direct transfer.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Codec`] if the record cannot be
    /// serialized, or [`TransferError::ChannelClosed`] if the sender
    /// task is gone.
    async fn forward(&self, record: SwitchRecord) -> Result<(), TransferError>;
}

/// Everything a strategy needs from its host node.
///
/// Built per switch session, so concurrent pipelines stay independent
/// and a strategy can be driven in tests with recording doubles.
#[derive(Clone)]
pub struct SwitchContext {
    /// This node's logical name.
    pub node: String,
    /// Session state shared with the processing path.
    pub session: Arc<SwitchSession>,
    /// The node's record buffers.
    pub queues: Arc<QueuePair>,
    /// Control-signal channel.
    pub signals: Arc<dyn SignalSender>,
    /// Direct record transfer toward the target instance; required by
    /// the original intermediary.
    pub forwarder: Option<Arc<dyn RecordForwarder>>,
    /// Emission or consumption control; required by the preceding node
    /// and the end nodes.
    pub flow: Option<Arc<dyn FlowControl>>,
    /// Tunables.
    pub config: SwitchConfig,
    /// Activity counters.
    pub metrics: Arc<SwitchMetrics>,
}

/// What a full-backlog or bounded replay forwards.
enum TransferBound {
    All { requested: u64 },
    Below { head: u64, floor: u64 },
}

/// One role's synchronization state machine for a single switch.
pub struct SwitchStrategy {
    role: SwitchRole,
    plan: SwitchPlan,
    ctx: SwitchContext,
    phase: SyncPhase,
    decision: Option<SyncDecision>,
    expected_replay: u64,
    replay_seen: u64,
    resumed: bool,
    finished: bool,
}

impl SwitchStrategy {
    /// Binds the algorithm to a role, a plan, and the node's resources.
    #[must_use]
    pub fn new(role: SwitchRole, plan: SwitchPlan, ctx: SwitchContext) -> Self {
        Self {
            role,
            plan,
            ctx,
            phase: SyncPhase::Active,
            decision: None,
            expected_replay: 0,
            replay_seen: 0,
            resumed: false,
            finished: false,
        }
    }

    /// The role this strategy runs.
    #[must_use]
    pub fn role(&self) -> SwitchRole {
        self.role
    }

    /// The plan this strategy runs under.
    #[must_use]
    pub fn plan(&self) -> &SwitchPlan {
        &self.plan
    }

    /// Current protocol phase.
    #[must_use]
    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    /// The reconciliation decision, once computed.
    #[must_use]
    pub fn decision(&self) -> Option<SyncDecision> {
        self.decision
    }

    /// Whether this role has reached its terminal state and finished
    /// all its work for the switch.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Enters the switch. Every role leaves `Active` here; the
    /// preceding node additionally pauses its emission, reports its
    /// high-water to the deciding role, and reroutes toward the target
    /// instance.
    ///
    /// # Errors
    ///
    /// Returns [`SwitchError::NotWired`] if the role is missing a flow
    /// controller it needs, or a signal error from the report.
    pub async fn begin(&mut self) -> Result<(), SwitchError> {
        self.ctx.session.set_target_port(self.plan.transfer_port);
        self.ctx.session.mark_started();
        self.phase = SyncPhase::Deciding;
        info!(
            node = %self.ctx.node,
            role = %self.role,
            pipeline = %self.plan.pipeline,
            "switch session started"
        );

        match self.role {
            SwitchRole::Preceding => {
                let flow = self.flow()?;
                flow.pause().await;
                let high_water = self.ctx.session.last_emitted_id();
                let target = self.plan.roles.target_intermediary.clone();
                self.send_to(&target, SwitchSignal::LastEmitted(high_water))
                    .await?;
                flow.reroute(&self.plan.pipeline, &target).await;
            }
            SwitchRole::EndNode => {
                self.flow()?.pause().await;
            }
            SwitchRole::OriginalIntermediary | SwitchRole::TargetIntermediary => {}
        }
        Ok(())
    }

    /// Routes one signal into the state machine.
    ///
    /// # Errors
    ///
    /// Returns [`SwitchError::UnexpectedSignal`] when the signal does
    /// not fit the role and phase, and propagates signal/transfer
    /// failures from the triggered step.
    pub async fn on_signal(
        &mut self,
        from: &str,
        signal: SwitchSignal,
    ) -> Result<(), SwitchError> {
        debug!(
            node = %self.ctx.node,
            from,
            signal = signal.name(),
            phase = %self.phase,
            "signal received"
        );
        match self.role {
            SwitchRole::TargetIntermediary => self.on_target_signal(signal).await,
            SwitchRole::OriginalIntermediary => self.on_original_signal(signal).await,
            SwitchRole::Preceding => self.on_preceding_signal(signal).await,
            SwitchRole::EndNode => self.on_end_signal(from, signal).await,
        }
    }

    async fn on_target_signal(&mut self, signal: SwitchSignal) -> Result<(), SwitchError> {
        match signal {
            SwitchSignal::LastEmitted(last_emitted) => {
                if self.phase != SyncPhase::Deciding {
                    return Err(self.unexpected("LastEmitted"));
                }
                self.decide(last_emitted).await?;
                Ok(())
            }
            SwitchSignal::Transferred(count) => self.on_transferred(count).await,
            other => Err(self.unexpected(other.name())),
        }
    }

    async fn on_original_signal(&mut self, signal: SwitchSignal) -> Result<(), SwitchError> {
        if self.phase != SyncPhase::Deciding {
            return Err(self.unexpected(signal.name()));
        }
        match signal {
            SwitchSignal::Transfer(requested) => {
                self.run_transfer(TransferBound::All { requested }).await
            }
            SwitchSignal::HeadId {
                head_id,
                last_processed_id,
            } => {
                self.run_transfer(TransferBound::Below {
                    head: head_id,
                    floor: last_processed_id,
                })
                .await
            }
            SwitchSignal::GoToPassive => self.passivate().await,
            other => Err(self.unexpected(other.name())),
        }
    }

    async fn on_preceding_signal(&mut self, signal: SwitchSignal) -> Result<(), SwitchError> {
        match signal {
            SwitchSignal::Synchronized => {
                if self.phase != SyncPhase::Deciding {
                    return Err(self.unexpected("Synchronized"));
                }
                self.flow()?.resume().await;
                self.phase = SyncPhase::Active;
                self.finished = true;
                info!(node = %self.ctx.node, "switch synchronized; emission resumed");
                Ok(())
            }
            other => Err(self.unexpected(other.name())),
        }
    }

    async fn on_end_signal(&mut self, from: &str, signal: SwitchSignal) -> Result<(), SwitchError> {
        match signal {
            SwitchSignal::Emit => {
                let flow = self.flow()?;
                flow.reroute(&self.plan.pipeline, from).await;
                flow.resume().await;
                self.resumed = true;
                debug!(node = %self.ctx.node, from, "consumption resumed");
                Ok(())
            }
            SwitchSignal::GoToActive => {
                if !self.resumed {
                    let flow = self.flow()?;
                    flow.reroute(&self.plan.pipeline, from).await;
                    flow.resume().await;
                    self.resumed = true;
                }
                self.phase = SyncPhase::Active;
                self.finished = true;
                info!(node = %self.ctx.node, "consumer attached to target instance");
                Ok(())
            }
            SwitchSignal::GoToPassive => {
                if self.ctx.node == self.plan.roles.target_end {
                    // Also serves the new path; only the old edge stops.
                    debug!(node = %self.ctx.node, "old path stopped");
                    return Ok(());
                }
                self.flow()?.pause().await;
                self.ctx.session.set_passive(true);
                self.phase = SyncPhase::Passive;
                self.finished = true;
                info!(node = %self.ctx.node, "consumer detached from original instance");
                Ok(())
            }
            other => Err(self.unexpected(other.name())),
        }
    }

    /// Accounts one replayed record delivered by the transfer channel
    /// and completes the switch once the expectation is met.
    ///
    /// # Errors
    ///
    /// Propagates signal failures from the completion step.
    pub async fn on_replay_record(&mut self) -> Result<(), SwitchError> {
        self.ctx.metrics.record_replayed();
        if self.role != SwitchRole::TargetIntermediary || self.phase != SyncPhase::Transferring {
            debug!(node = %self.ctx.node, "replayed record outside the transfer window");
            return Ok(());
        }
        self.replay_seen += 1;
        if self.replay_seen >= self.expected_replay {
            self.complete().await?;
        }
        Ok(())
    }

    /// The decision step: reconcile the reported emission high-water
    /// against this node's processed floor and buffered input. A
    /// report at or below the floor leaves nothing to replay and takes
    /// the caught-up shortcut.
    ///
    /// Runs on the deciding role when the preceding node reports its
    /// high-water. Public so the decision table can be exercised
    /// directly.
    ///
    /// # Errors
    ///
    /// Propagates signal failures from the triggered signals.
    pub async fn decide(&mut self, last_emitted: u64) -> Result<SyncDecision, SwitchError> {
        self.ctx.session.note_emitted(last_emitted);
        let floor = self.ctx.session.last_processed_id();
        let gap = last_emitted.saturating_sub(floor);
        let overload = self.ctx.config.overload_size;
        let backlog = self.ctx.queues.out_len() as u64;

        let decision = if last_emitted <= floor || backlog > overload || gap > overload {
            if last_emitted <= floor {
                SyncDecision::CaughtUp
            } else {
                SyncDecision::Overloaded {
                    floor,
                    target: last_emitted,
                }
            }
        } else {
            self.ctx.session.set_transferring(true);
            match self.ctx.queues.peek_in() {
                None => SyncDecision::ReplayAll {
                    floor,
                    target: last_emitted,
                },
                Some(head) if head.id() > floor => SyncDecision::ReplayRange {
                    floor,
                    head: head.id(),
                    target: last_emitted,
                },
                Some(_) => {
                    let drained = self.ctx.queues.drain_in_while(|r| r.id() < floor) as u64;
                    SyncDecision::SkipProcessed {
                        floor,
                        target: last_emitted,
                        drained,
                    }
                }
            }
        };
        self.decision = Some(decision);
        debug!(node = %self.ctx.node, ?decision, "synchronization decision");
        self.apply(decision).await?;
        Ok(decision)
    }

    /// Acts on a freshly computed decision: request replays, silence
    /// the original instance, or complete outright.
    async fn apply(&mut self, decision: SyncDecision) -> Result<(), SwitchError> {
        let original = self.plan.roles.original_intermediary.clone();
        let downstream = self.plan.roles.target_end.clone();
        match decision {
            SyncDecision::CaughtUp | SyncDecision::Overloaded { .. } => {
                if let SyncDecision::Overloaded { floor, target } = decision {
                    self.ctx.metrics.record_abandoned(target - floor);
                    warn!(
                        node = %self.ctx.node,
                        abandoned = target - floor,
                        "replay gap exceeds overload tolerance; abandoning"
                    );
                }
                self.ctx.queues.clear_out();
                self.send_to(&downstream, SwitchSignal::Emit).await?;
                self.send_to(&original, SwitchSignal::GoToPassive).await?;
                self.complete().await?;
            }
            SyncDecision::ReplayAll { floor, target } => {
                let requested = target.saturating_sub(floor);
                self.ctx.session.set_transfer_all(true);
                self.ctx.session.set_num_transferred(requested);
                self.expected_replay = requested;
                self.send_to(&original, SwitchSignal::Transfer(requested))
                    .await?;
                self.send_to(&downstream, SwitchSignal::Emit).await?;
                self.phase = SyncPhase::Transferring;
            }
            SyncDecision::ReplayRange { floor, head, .. } => {
                let expected = head - floor - 1;
                self.ctx.session.set_head_id(head);
                self.ctx.session.set_num_transferred(expected);
                self.ctx.session.set_first_transferred_id(head - 1);
                self.expected_replay = expected;
                self.send_to(
                    &original,
                    SwitchSignal::HeadId {
                        head_id: head,
                        last_processed_id: floor,
                    },
                )
                .await?;
                self.send_to(&downstream, SwitchSignal::Emit).await?;
                self.phase = SyncPhase::Transferring;
                if expected == 0 {
                    self.complete().await?;
                }
            }
            SyncDecision::SkipProcessed { drained, .. } => {
                debug!(node = %self.ctx.node, drained, "input head already processed");
                self.send_to(&original, SwitchSignal::GoToPassive).await?;
                self.complete().await?;
            }
        }
        Ok(())
    }

    /// The data-transfer step: forward the retained backlog (then the
    /// pending input) over the transfer channel, ack a shortfall, and
    /// go passive.
    async fn run_transfer(&mut self, bound: TransferBound) -> Result<(), SwitchError> {
        self.phase = SyncPhase::Transferring;
        self.ctx.session.set_transferring(true);
        let forwarder = self
            .ctx
            .forwarder
            .clone()
            .ok_or(SwitchError::NotWired("a record forwarder"))?;

        let (floor, cap, expected) = match bound {
            TransferBound::All { requested } => {
                self.ctx.session.set_transfer_all(true);
                (self.ctx.session.last_processed_id(), None, requested)
            }
            TransferBound::Below { head, floor } => {
                self.ctx.session.set_head_id(head);
                self.ctx.session.note_processed(floor);
                (floor, Some(head), head.saturating_sub(floor + 1))
            }
        };

        forwarder.forward_flag(ControlFlag::SwitchRecord).await?;
        let queue_flag = if cap.is_some() {
            ControlFlag::TemporaryQueue
        } else {
            ControlFlag::GeneralQueue
        };
        forwarder.forward_flag(queue_flag).await?;

        let mut forwarded = 0u64;
        let backlog = self
            .ctx
            .queues
            .snapshot_out()
            .into_iter()
            .chain(self.ctx.queues.snapshot_in());
        for record in backlog {
            if cap.is_some_and(|head| record.id() >= head) {
                break;
            }
            if record.id() > floor {
                forwarder.forward(record).await?;
                forwarded += 1;
            }
        }

        if forwarded < expected {
            // Part of the gap was already consumed or dropped; the
            // target lowers its expectation from this ack.
            let target = self.plan.roles.target_intermediary.clone();
            self.send_to(&target, SwitchSignal::Transferred(forwarded))
                .await?;
        }

        self.ctx.queues.clear_out();
        self.ctx.session.set_passive(true);
        self.ctx.session.set_transferring(false);
        let original_end = self.plan.roles.original_end.clone();
        self.send_to(&original_end, SwitchSignal::GoToPassive).await?;
        self.phase = SyncPhase::Passive;
        self.finished = true;
        info!(
            node = %self.ctx.node,
            forwarded,
            expected,
            "backlog transferred; original instance passive"
        );
        Ok(())
    }

    /// Passivation without a replay: the deciding side found nothing
    /// for this instance to forward.
    async fn passivate(&mut self) -> Result<(), SwitchError> {
        self.ctx.queues.clear();
        self.ctx.session.set_passive(true);
        self.ctx.session.set_transferring(false);
        let original_end = self.plan.roles.original_end.clone();
        self.send_to(&original_end, SwitchSignal::GoToPassive).await?;
        self.phase = SyncPhase::Passive;
        self.finished = true;
        info!(node = %self.ctx.node, "nothing to replay; original instance passive");
        Ok(())
    }

    /// Shortfall acknowledgement from the replaying instance.
    async fn on_transferred(&mut self, count: u64) -> Result<(), SwitchError> {
        if self.phase != SyncPhase::Transferring {
            return Err(self.unexpected("Transferred"));
        }
        if count < self.expected_replay {
            debug!(
                node = %self.ctx.node,
                expected = self.expected_replay,
                actual = count,
                "replay expectation lowered"
            );
            self.expected_replay = count;
            self.ctx.session.set_num_transferred(count);
        }
        if self.replay_seen >= self.expected_replay {
            self.complete().await?;
        }
        Ok(())
    }

    /// The completion step: confirm to the preceding role, then either
    /// activate or leave activation to a concurrent passivation.
    async fn complete(&mut self) -> Result<(), SwitchError> {
        let preceding = self.plan.roles.preceding.clone();
        self.send_to(&preceding, SwitchSignal::Synchronized).await?;

        if self.ctx.session.is_passive() {
            // A concurrent passivation owns the activation decision.
            self.ctx.session.set_transferring(false);
            self.ctx.session.set_first_transferred_id(0);
            debug!(node = %self.ctx.node, "completion deferred to pending passivation");
        } else {
            self.ctx.session.set_passive(false);
            self.ctx.session.set_transferring(false);
            self.ctx.session.set_first_transferred_id(0);
            let downstream = self.plan.roles.target_end.clone();
            self.send_to(&downstream, SwitchSignal::GoToActive).await?;
            self.phase = SyncPhase::Active;
            info!(node = %self.ctx.node, "switch synchronized; target instance active");
        }
        self.finished = true;
        Ok(())
    }

    async fn send_to(&self, node: &str, signal: SwitchSignal) -> Result<(), SwitchError> {
        self.ctx
            .signals
            .send(&self.plan.pipeline, node, signal)
            .await?;
        self.ctx.metrics.record_signal_sent();
        Ok(())
    }

    fn flow(&self) -> Result<Arc<dyn FlowControl>, SwitchError> {
        self.ctx
            .flow
            .clone()
            .ok_or(SwitchError::NotWired("a flow controller"))
    }

    fn unexpected(&self, signal: &str) -> SwitchError {
        SwitchError::UnexpectedSignal {
            signal: signal.to_string(),
            role: self.role.to_string(),
            phase: self.phase.to_string(),
        }
    }
}
