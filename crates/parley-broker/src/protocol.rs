//! Wire protocol.
//!
//! One JSON object per WebSocket text frame, discriminated by `type`:
//!
//! ```text
//! client -> server                         server -> client
//! {type:"hello", user}                     {type:"session", sessionId, connId}
//! {type:"reconnect", sessionId, lastSeq}   {type:"replay", messages:[...]} | {type:"replayGap"}
//! {type:"join", room}                      {type:"presence", connId, state}
//! {type:"send", room, user, text}          {type:"deliver", room, user, text, seq, ts}
//! {type:"presence", state}                 {type:"error", code, message}
//! {type:"logout"}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BrokerError;
use crate::types::{ConnectionId, ConnectionState, Message, RoomId, SessionId};

/// Frames sent by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// Submit a chat message to a room
    Send {
        /// Target room
        room: RoomId,
        /// Sender label
        user: String,
        /// Payload text
        text: String,
    },
    /// Start a new session for this connection
    Hello {
        /// Owning user label
        user: String,
    },
    /// Reattach an existing session
    Reconnect {
        /// Session token issued by an earlier `session` frame
        session_id: SessionId,
        /// Highest sequence number the client has processed
        last_seq: u64,
    },
    /// Join a room
    Join {
        /// Room to join
        room: RoomId,
    },
    /// Announce a liveness change (e.g. `closing` before a clean shutdown)
    Presence {
        /// New state
        state: ConnectionState,
    },
    /// End the session explicitly
    Logout,
}

/// Body of a `deliver` frame, also used inside `replay`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliverPayload {
    /// Room the message belongs to
    pub room: RoomId,
    /// Sender label
    pub user: String,
    /// Payload text
    pub text: String,
    /// Room sequence number
    pub seq: u64,
    /// Origination timestamp
    pub ts: DateTime<Utc>,
}

impl From<&Message> for DeliverPayload {
    fn from(message: &Message) -> Self {
        Self {
            room: message.room.clone(),
            user: message.user.clone(),
            text: message.text.clone(),
            seq: message.seq,
            ts: message.timestamp,
        }
    }
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    /// A sequenced room message
    Deliver(DeliverPayload),
    /// A connection's liveness changed
    Presence {
        /// Connection whose state changed
        conn_id: ConnectionId,
        /// New state
        state: ConnectionState,
    },
    /// Messages missed while detached, in sequence order
    Replay {
        /// Buffered messages after the client's `lastSeq`
        messages: Vec<DeliverPayload>,
    },
    /// Requested history aged out; the client must resync out of band
    ReplayGap,
    /// Session handshake result
    Session {
        /// Token to present on reconnect
        session_id: SessionId,
        /// This connection's id
        conn_id: ConnectionId,
    },
    /// A request failed
    Error {
        /// Stable error code, see [`BrokerError::code`]
        code: String,
        /// Human readable description
        message: String,
    },
}

impl ServerFrame {
    /// Build a `deliver` frame from a sequenced message.
    pub fn deliver(message: &Message) -> Self {
        Self::Deliver(DeliverPayload::from(message))
    }

    /// Build an `error` frame from a broker error.
    pub fn error(err: &BrokerError) -> Self {
        Self::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    /// Short name for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Deliver(_) => "deliver",
            Self::Presence { .. } => "presence",
            Self::Replay { .. } => "replay",
            Self::ReplayGap => "replayGap",
            Self::Session { .. } => "session",
            Self::Error { .. } => "error",
        }
    }
}

/// Parse a client text frame.
pub fn decode_client_frame(text: &str) -> Result<ClientFrame, BrokerError> {
    serde_json::from_str(text.trim())
        .map_err(|e| BrokerError::protocol(format!("invalid frame: {}", e)))
}

/// Encode a server frame as a JSON text frame.
pub fn encode_server_frame(frame: &ServerFrame) -> Result<String, BrokerError> {
    Ok(serde_json::to_string(frame)?)
}
