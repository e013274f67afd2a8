//! Error types for the chat transport core.

use thiserror::Error;

use crate::types::{ConnectionId, RoomId, SessionId};

/// Broker errors.
///
/// Per-recipient delivery failures are deliberately absent: they are
/// recorded in a [`DeliveryReport`](crate::broadcast::DeliveryReport) and
/// never unwind into the publishing call.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// A configured connection limit was hit (global or per room).
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// The room was never initialized and auto-creation is disabled.
    #[error("Room not found: {0}")]
    RoomNotFound(RoomId),

    /// The requested replay position has aged out of the session buffer.
    #[error("Replay gap: requested after {requested}, oldest buffered is {oldest_available:?}")]
    ReplayGap {
        /// Last sequence number the client acknowledged
        requested: u64,
        /// Oldest sequence number still held, if any
        oldest_available: Option<u64>,
    },

    /// The session does not exist or its grace period ran out.
    #[error("Session expired: {0}")]
    SessionExpired(SessionId),

    /// The room's sequence counter would overflow. Fatal for that room.
    #[error("Sequence counter overflow in room {0}")]
    SequenceOverflow(RoomId),

    /// The room's sequencer was halted by an earlier overflow.
    #[error("Room {0} is halted")]
    RoomHalted(RoomId),

    /// No registered connection with this id.
    #[error("Connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    /// Malformed inbound frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// JSON encoding/decoding error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The broker is shutting down.
    #[error("Broker is shutting down")]
    Shutdown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Create a new capacity error.
    pub fn capacity(msg: impl Into<String>) -> Self {
        Self::CapacityExceeded(msg.into())
    }

    /// Create a new protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the condition requires operator intervention.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SequenceOverflow(_) | Self::RoomHalted(_))
    }

    /// Stable code used in outbound `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            Self::CapacityExceeded(_) => "capacityExceeded",
            Self::RoomNotFound(_) => "roomNotFound",
            Self::ReplayGap { .. } => "replayGap",
            Self::SessionExpired(_) => "sessionExpired",
            Self::SequenceOverflow(_) => "sequenceOverflow",
            Self::RoomHalted(_) => "roomHalted",
            Self::ConnectionNotFound(_) => "connectionNotFound",
            Self::Protocol(_) | Self::Serialization(_) => "badRequest",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}
