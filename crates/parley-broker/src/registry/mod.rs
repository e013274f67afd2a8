//! Connection Registry.
//!
//! Tracks every live transport by [`ConnectionId`](crate::ConnectionId), the
//! room each one is in, and its liveness state. Each connection registers the
//! sending half of its outbound frame queue; the registry is the only owner of
//! that handle and lends clones to the broadcast engine for a single delivery.
//!
//! ```text
//! ws actor (conn A) --register--> ConnectionRegistry <--recipients(room)-- BroadcastEngine
//!        ^                              |
//!        |                              v
//!   mpsc::Receiver            DashMap<ConnectionId, ConnectionEntry>
//!                             DashMap<RoomId, HashSet<ConnectionId>>
//! ```

mod connection_registry;

pub use connection_registry::{ConnectionInfo, ConnectionRegistry, Recipient, SendResult};
