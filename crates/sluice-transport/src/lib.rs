//! # Sluice Transport
//!
//! The network layer of the switch protocol: signed length-prefixed
//! framing for the record transfer channel, the background transfer
//! sender with its lazy connect and single-retry policy, the accepting
//! side that routes received records into queues, in-process signal
//! routing, and logical-name resolution.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

/// In-process signal routing between coordinators
pub mod bus;

/// Signed length-prefixed frame encoding
pub mod frame;

/// Logical node name to host resolution
pub mod resolver;

/// Outbound transfer connection with queueing and retry
pub mod sender;

/// Inbound transfer listener
pub mod server;

pub use bus::{BusSender, LocalSignalBus};
pub use frame::{read_frame, write_frame, TransferFrame};
pub use resolver::{HostResolver, StaticResolver};
pub use sender::{TransferForwarder, TransferSender};
pub use server::{QueueTarget, ReceiverSink, TransferServer};
