//! # Sluice Core
//!
//! Protocol core for live operator switching in a streaming pipeline:
//! the record and queue model, per-switch session state, the control
//! signal vocabulary, and the role-parameterized synchronization
//! algorithm that reconciles the buffered and direct-transfer data
//! paths by record id.
//!
//! Networking (the record transfer channel and signal routing) lives in
//! `sluice-transport`; per-node wiring lives in `sluice-node`.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

/// Switch tunables and their defaults
pub mod config;

/// Error types shared across the protocol crates
pub mod error;

/// Switch activity counters
pub mod metrics;

/// Switch participants and the distributed switch plan
pub mod plan;

/// Paired in/out record buffers
pub mod queue;

/// The transferable record unit, framing flags, and the byte codec seam
pub mod record;

/// Per-switch shared session state
pub mod session;

/// Control-signal vocabulary and the signal channel seam
pub mod signal;

/// The synchronization state machine shared by all four roles
pub mod strategy;

pub use config::SwitchConfig;
pub use error::{ResolveError, SignalError, SwitchError, TransferError};
pub use metrics::{SwitchMetrics, SwitchMetricsSnapshot};
pub use plan::{RoleIdentity, SwitchPlan, SwitchRole};
pub use queue::QueuePair;
pub use record::{BincodeCodec, ControlFlag, RecordCodec, SwitchRecord};
pub use session::{SessionSnapshot, SwitchSession};
pub use signal::{SignalEnvelope, SignalSender, SwitchSignal};
pub use strategy::{
    FlowControl, RecordForwarder, SwitchContext, SwitchStrategy, SyncDecision, SyncPhase,
};
