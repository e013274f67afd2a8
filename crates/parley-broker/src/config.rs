//! Broker configuration.
//!
//! All knobs are plain values injected through [`Broker::new`](crate::Broker::new);
//! nothing is read from globals. The server binary layers these from a TOML
//! file and environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default replay buffer bound per session.
pub const DEFAULT_REPLAY_BUFFER_SIZE: usize = 256;

/// Default session grace period (60 seconds).
pub const DEFAULT_SESSION_GRACE_PERIOD_MS: u64 = 60_000;

/// Default per-delivery send timeout.
pub const DEFAULT_DELIVERY_TIMEOUT_MS: u64 = 2_000;

/// Default idle timeout for connections (90 seconds).
pub const DEFAULT_CONNECTION_IDLE_TIMEOUT_MS: u64 = 90_000;

/// Configuration for the broker and its components.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Maximum registered connections across all rooms
    pub max_connections: usize,
    /// Maximum member connections in a single room
    pub max_connections_per_room: usize,
    /// Number of sequenced messages retained per session for replay
    pub replay_buffer_size: usize,
    /// How long a detached session survives before it expires
    pub session_grace_period_ms: u64,
    /// Per-recipient send timeout
    pub delivery_timeout_ms: u64,
    /// Consecutive delivery failures tolerated before a recipient is evicted
    pub max_consecutive_failures: u32,
    /// Create rooms on first use instead of failing with `RoomNotFound`
    pub auto_create_rooms: bool,
    /// Capacity of each connection's outbound frame queue
    pub outbound_queue_capacity: usize,
    /// How often the sweeper looks for expired sessions
    pub session_sweep_interval_ms: u64,
    /// Connections not heard from for this long are dropped; 0 disables
    pub connection_idle_timeout_ms: u64,
    /// Room workers with nothing to do for this long are stopped
    pub room_idle_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            max_connections_per_room: 1_000,
            replay_buffer_size: DEFAULT_REPLAY_BUFFER_SIZE,
            session_grace_period_ms: DEFAULT_SESSION_GRACE_PERIOD_MS,
            delivery_timeout_ms: DEFAULT_DELIVERY_TIMEOUT_MS,
            max_consecutive_failures: 3,
            auto_create_rooms: true,
            outbound_queue_capacity: 256,
            session_sweep_interval_ms: 5_000,
            connection_idle_timeout_ms: DEFAULT_CONNECTION_IDLE_TIMEOUT_MS,
            room_idle_timeout_ms: 300_000,
        }
    }
}

impl BrokerConfig {
    /// Session grace period as a [`Duration`].
    pub fn session_grace_period(&self) -> Duration {
        Duration::from_millis(self.session_grace_period_ms)
    }

    /// Delivery timeout as a [`Duration`].
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    /// Connection idle timeout, or `None` when disabled.
    pub fn connection_idle_timeout(&self) -> Option<Duration> {
        (self.connection_idle_timeout_ms > 0)
            .then(|| Duration::from_millis(self.connection_idle_timeout_ms))
    }

    /// Room worker idle timeout as a [`Duration`], never zero.
    pub fn room_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.room_idle_timeout_ms.max(1))
    }

    /// Sweep interval as a [`Duration`], never zero.
    pub fn session_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.session_sweep_interval_ms.max(1))
    }
}
