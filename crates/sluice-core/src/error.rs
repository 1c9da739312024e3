//! Error types for the switching protocol.

use thiserror::Error;

/// Errors raised by the signal channel.
#[derive(Debug, Error)]
pub enum SignalError {
    /// A signal arrived under a name this protocol does not define.
    #[error("unknown signal: {0}")]
    UnknownSignal(String),

    /// A signal payload did not match its documented encoding.
    #[error("bad {signal} payload: {reason}")]
    Payload {
        /// The signal whose payload was malformed.
        signal: String,
        /// What was wrong with it.
        reason: String,
    },
}

/// Errors raised by the record transfer channel.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Failed to bind the transfer listener.
    #[error("bind error: {0}")]
    Bind(String),

    /// Failed to connect to the transfer receiver.
    #[error("connection error to {address}: {reason}")]
    Connection {
        /// The address that failed.
        address: String,
        /// Reason for failure.
        reason: String,
    },

    /// A frame exceeded the configured size cap.
    #[error("frame of {size} bytes exceeds cap of {max}")]
    FrameTooLarge {
        /// Declared payload size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A control frame carried an unrecognized flag.
    #[error("unknown control flag: {0}")]
    UnknownFlag(String),

    /// Record serialization/deserialization failure.
    #[error("codec error: {0}")]
    Codec(String),

    /// The sender task has shut down.
    #[error("transfer channel closed")]
    ChannelClosed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by logical-name resolution.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The node is not known to the resolver.
    #[error("no host registered for node {node} of pipeline {pipeline}")]
    UnknownNode {
        /// The pipeline the lookup was scoped to.
        pipeline: String,
        /// The logical node name.
        node: String,
    },
}

/// Errors raised by the synchronization strategy and coordinator.
#[derive(Debug, Error)]
pub enum SwitchError {
    /// A signal arrived that the active strategy cannot handle in its
    /// current phase.
    #[error("unexpected signal {signal} for {role} in phase {phase}")]
    UnexpectedSignal {
        /// The offending signal name.
        signal: String,
        /// The role that received it.
        role: String,
        /// The phase it arrived in.
        phase: String,
    },

    /// The role was started without a resource it needs.
    #[error("role is not wired with {0}")]
    NotWired(&'static str),

    /// Signal channel failure.
    #[error("signal error: {0}")]
    Signal(#[from] SignalError),

    /// Transfer channel failure.
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// Name resolution failure.
    #[error("resolve error: {0}")]
    Resolve(#[from] ResolveError),
}
