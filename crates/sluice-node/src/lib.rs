//! # Sluice Node
//!
//! Per-node wiring for the switch protocol: a mailbox-driven
//! coordinator that owns at most one switch session at a time, routes
//! signals and replayed records into the session's strategy, and an
//! emission layer that can be paused, rerouted, and resumed while a
//! switch is in flight.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

/// The per-node switch coordinator and its mailbox
pub mod coordinator;

/// Record emission with in-flight rerouting
pub mod emitter;

pub use coordinator::{CoordinatorEvent, CoordinatorHandle, ReplaySink, SwitchCoordinator};
pub use emitter::{QueueEmitter, RecordEmitter, RoutingEmitter};
