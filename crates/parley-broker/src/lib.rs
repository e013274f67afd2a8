//! # parley-broker
//!
//! Real-time chat transport core for Parley.
//!
//! Clients connect, join a room and submit messages; every message gets the
//! next sequence number in its room and is delivered to every live member.
//! Sessions outlive individual connections so a client that drops can
//! reattach and replay what it missed.
//!
//! ## Architecture
//!
//! - **Connection Registry**: live connections, liveness state, room membership
//! - **Message Sequencer**: per-room monotonic sequence numbers
//! - **Broadcast Engine**: concurrent fan-out with per-recipient timeouts
//! - **Session Manager**: replay buffers and grace-period expiry
//! - **Broker**: wires the above together with one worker task per room
//!
//! The crate is transport-agnostic. A connection is just the receiving end
//! of a bounded frame queue; `parley-server` drives those queues from
//! WebSockets.

pub mod broadcast;
pub mod config;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod sequencer;
pub mod session;

mod broker;
mod error;
mod types;

pub use broadcast::{BroadcastEngine, DeliveryFailure, DeliveryReport, FailureReason};
pub use broker::{Broker, Published};
pub use config::BrokerConfig;
pub use error::BrokerError;
pub use protocol::{ClientFrame, DeliverPayload, ServerFrame};
pub use registry::{ConnectionInfo, ConnectionRegistry, SendResult};
pub use sequencer::MessageSequencer;
pub use session::{InMemorySessionStore, ReplayBatch, SessionInfo, SessionState, SessionStore};
pub use types::*;
