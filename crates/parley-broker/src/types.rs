//! Common types for the chat transport core.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier for a registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a fresh connection id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session token handed to clients for reconnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a fresh session id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Name of a room. Rooms share one sequence space per name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Create a room id from any string-like value.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow the room name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Liveness state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Registered, handshake not yet confirmed
    Connecting,
    /// Fully established
    Open,
    /// Client announced it is going away
    Closing,
    /// Removed from the registry
    Closed,
}

impl ConnectionState {
    /// Whether a connection in this state should receive room traffic.
    pub fn is_live(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Open)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Closing => write!(f, "closing"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// An inbound chat message before it has been sequenced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Sender label
    pub user: String,
    /// Payload text
    pub text: String,
}

impl RawMessage {
    /// Create a raw message.
    pub fn new(user: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            text: text.into(),
        }
    }
}

/// A sequenced message. Never mutated after the sequencer creates it;
/// components share it as `Arc<Message>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Room the message was sequenced in
    pub room: RoomId,
    /// Sender label
    pub user: String,
    /// Payload text
    pub text: String,
    /// Sequence number, strictly increasing within `room`
    pub seq: u64,
    /// When the sequencer accepted the message
    pub timestamp: DateTime<Utc>,
}

/// Notification emitted by the registry when a connection's liveness or room
/// membership changes. A connection leaving a room is reported to that room
/// as `Closed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEvent {
    /// The connection whose state changed
    pub connection: ConnectionId,
    /// Room whose members should hear about it, if any
    pub room: Option<RoomId>,
    /// New liveness state
    pub state: ConnectionState,
}
