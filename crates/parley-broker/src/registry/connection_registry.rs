//! Connection Registry implementation.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::BrokerError;
use crate::metrics;
use crate::protocol::ServerFrame;
use crate::types::{ConnectionId, ConnectionState, PresenceEvent, RoomId};

/// Capacity of the presence notification channel.
const PRESENCE_CHANNEL_CAPACITY: usize = 1024;

/// Connection state stored in the registry.
#[derive(Debug)]
struct ConnectionEntry {
    /// Outbound frame queue for this connection
    sender: mpsc::Sender<ServerFrame>,
    /// Liveness state
    state: ConnectionState,
    /// Room the connection is a member of
    room: Option<RoomId>,
    /// Last time the connection was heard from
    last_seen: DateTime<Utc>,
    /// Consecutive failed deliveries, shared with in-flight deliveries
    consecutive_failures: Arc<AtomicU32>,
    /// Cancelled when the connection is unregistered
    cancel: CancellationToken,
}

impl ConnectionEntry {
    fn new(sender: mpsc::Sender<ServerFrame>) -> Self {
        Self {
            sender,
            state: ConnectionState::Connecting,
            room: None,
            last_seen: Utc::now(),
            consecutive_failures: Arc::new(AtomicU32::new(0)),
            cancel: CancellationToken::new(),
        }
    }
}

/// Snapshot of a connection, detached from the registry's locks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Connection id
    pub id: ConnectionId,
    /// Liveness state at snapshot time
    pub state: ConnectionState,
    /// Room membership at snapshot time
    pub room: Option<RoomId>,
    /// Last time the connection was heard from
    pub last_seen: DateTime<Utc>,
}

/// Delivery handle lent to the broadcast engine for one publish.
#[derive(Debug, Clone)]
pub struct Recipient {
    /// Connection id
    pub id: ConnectionId,
    /// Outbound frame queue
    pub sender: mpsc::Sender<ServerFrame>,
    /// Fires when the connection goes away mid-delivery
    pub cancel: CancellationToken,
    /// Consecutive failure counter for this connection
    pub consecutive_failures: Arc<AtomicU32>,
}

/// Result of attempting a direct, non-blocking send to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// Frame was queued for delivery
    Sent,
    /// The connection is not registered
    NotConnected,
    /// The outbound queue is full (backpressure)
    ChannelFull,
    /// The outbound queue is closed; the entry was removed
    ChannelClosed,
}

/// Registry of active connections and room membership.
///
/// Thread-safe; uses DashMap so lookups never need an explicit lock. No
/// method holds a guard on one map while touching the other.
pub struct ConnectionRegistry {
    /// Connection entries by id
    connections: DashMap<ConnectionId, ConnectionEntry>,
    /// Room membership index
    rooms: DashMap<RoomId, HashSet<ConnectionId>>,
    /// Reserved slots, checked against `max_connections`
    registered: AtomicUsize,
    max_connections: usize,
    max_connections_per_room: usize,
    /// Connections not heard from for this long are stale
    idle_timeout: Option<Duration>,
    presence_tx: broadcast::Sender<PresenceEvent>,
}

impl ConnectionRegistry {
    /// Create a registry with the given limits.
    pub fn new(max_connections: usize, max_connections_per_room: usize) -> Self {
        info!(
            max_connections,
            max_connections_per_room, "Creating connection registry"
        );
        let (presence_tx, _) = broadcast::channel(PRESENCE_CHANNEL_CAPACITY);
        Self {
            connections: DashMap::new(),
            rooms: DashMap::new(),
            registered: AtomicUsize::new(0),
            max_connections,
            max_connections_per_room,
            idle_timeout: None,
            presence_tx,
        }
    }

    /// Treat connections not heard from within `idle_timeout` as stale.
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Subscribe to presence-changed notifications.
    pub fn subscribe_presence(&self) -> broadcast::Receiver<PresenceEvent> {
        self.presence_tx.subscribe()
    }

    /// Register a connection with its outbound queue.
    ///
    /// Fails with `CapacityExceeded` once `max_connections` are registered.
    #[instrument(skip(self, sender))]
    pub fn register(&self, sender: mpsc::Sender<ServerFrame>) -> Result<ConnectionId, BrokerError> {
        let max = self.max_connections;
        if self
            .registered
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .is_err()
        {
            warn!(max, "Connection limit reached, rejecting registration");
            return Err(BrokerError::capacity(format!(
                "connection limit of {} reached",
                max
            )));
        }

        let id = ConnectionId::new();
        self.connections.insert(id, ConnectionEntry::new(sender));
        metrics::record_connections_active(self.connections.len());
        debug!(conn = %id, "Registered new connection");
        Ok(id)
    }

    /// Unregister a connection.
    ///
    /// Idempotent: returns `None` if the id was already removed. Cancels
    /// in-flight deliveries to the connection and emits a `closed` presence
    /// notification.
    #[instrument(skip(self), fields(conn = %id))]
    pub fn unregister(&self, id: &ConnectionId) -> Option<ConnectionInfo> {
        let Some((_, entry)) = self.connections.remove(id) else {
            debug!("Connection was not registered");
            return None;
        };
        self.registered.fetch_sub(1, Ordering::AcqRel);
        entry.cancel.cancel();

        if let Some(room) = &entry.room {
            self.remove_member(room, id);
        }

        metrics::record_connections_active(self.connections.len());
        debug!("Unregistered connection");

        self.emit(PresenceEvent {
            connection: *id,
            room: entry.room.clone(),
            state: ConnectionState::Closed,
        });

        Some(ConnectionInfo {
            id: *id,
            state: ConnectionState::Closed,
            room: entry.room,
            last_seen: entry.last_seen,
        })
    }

    /// Update a connection's liveness state.
    ///
    /// Setting `Closed` is equivalent to [`unregister`](Self::unregister).
    /// Emits a notification only when the state actually changes.
    #[instrument(skip(self), fields(conn = %id))]
    pub fn set_presence(&self, id: &ConnectionId, state: ConnectionState) -> Result<(), BrokerError> {
        if state == ConnectionState::Closed {
            return self
                .unregister(id)
                .map(|_| ())
                .ok_or(BrokerError::ConnectionNotFound(*id));
        }

        let (previous, room) = {
            let mut entry = self
                .connections
                .get_mut(id)
                .ok_or(BrokerError::ConnectionNotFound(*id))?;
            let previous = entry.state;
            entry.state = state;
            entry.last_seen = Utc::now();
            (previous, entry.room.clone())
        };

        if previous != state {
            debug!(from = %previous, to = %state, "Presence changed");
            self.emit(PresenceEvent {
                connection: *id,
                room,
                state,
            });
        }
        Ok(())
    }

    /// Refresh a connection's last-seen timestamp.
    pub fn touch(&self, id: &ConnectionId) -> bool {
        match self.connections.get_mut(id) {
            Some(mut entry) => {
                entry.last_seen = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Move a connection into a room, leaving its previous room.
    ///
    /// The new room is told the connection's current state; the room it left
    /// sees it as `closed`. Fails with `CapacityExceeded` when the room
    /// already holds `max_connections_per_room` members.
    #[instrument(skip(self), fields(conn = %id, room = %room))]
    pub fn join(&self, id: &ConnectionId, room: &RoomId) -> Result<(), BrokerError> {
        let previous = self
            .connections
            .get(id)
            .map(|entry| entry.room.clone())
            .ok_or(BrokerError::ConnectionNotFound(*id))?;

        if previous.as_ref() == Some(room) {
            return Ok(());
        }

        {
            let mut members = self.rooms.entry(room.clone()).or_default();
            if members.len() >= self.max_connections_per_room {
                warn!(
                    limit = self.max_connections_per_room,
                    "Room is full, rejecting join"
                );
                return Err(BrokerError::capacity(format!(
                    "room {} is full ({} connections)",
                    room, self.max_connections_per_room
                )));
            }
            members.insert(*id);
        }

        let state = self.connections.get_mut(id).map(|mut entry| {
            entry.room = Some(room.clone());
            entry.last_seen = Utc::now();
            entry.state
        });

        let Some(state) = state else {
            // Unregistered while we were joining.
            self.remove_member(room, id);
            return Err(BrokerError::ConnectionNotFound(*id));
        };

        if let Some(previous) = previous {
            self.remove_member(&previous, id);
            self.emit(PresenceEvent {
                connection: *id,
                room: Some(previous),
                state: ConnectionState::Closed,
            });
        }

        debug!("Connection joined room");
        self.emit(PresenceEvent {
            connection: *id,
            room: Some(room.clone()),
            state,
        });
        Ok(())
    }

    /// Remove a connection from its room, if it is in one.
    ///
    /// The room sees the connection as `closed`.
    pub fn leave(&self, id: &ConnectionId) -> Option<RoomId> {
        let room = self.connections.get_mut(id).and_then(|mut entry| entry.room.take())?;
        self.remove_member(&room, id);
        debug!(conn = %id, room = %room, "Connection left room");
        self.emit(PresenceEvent {
            connection: *id,
            room: Some(room.clone()),
            state: ConnectionState::Closed,
        });
        Some(room)
    }

    /// List live connections that are members of a room.
    pub fn list_by_room(&self, room: &RoomId) -> Vec<ConnectionId> {
        self.recipients(room).into_iter().map(|r| r.id).collect()
    }

    /// Delivery handles for every live member of a room.
    pub fn recipients(&self, room: &RoomId) -> Vec<Recipient> {
        let members: Vec<ConnectionId> = match self.rooms.get(room) {
            Some(members) => members.iter().copied().collect(),
            None => return Vec::new(),
        };

        members
            .into_iter()
            .filter_map(|id| {
                let entry = self.connections.get(&id)?;
                entry.state.is_live().then(|| Recipient {
                    id,
                    sender: entry.sender.clone(),
                    cancel: entry.cancel.clone(),
                    consecutive_failures: Arc::clone(&entry.consecutive_failures),
                })
            })
            .collect()
    }

    /// Queue a frame for one connection without waiting.
    pub fn send_to(&self, id: &ConnectionId, frame: ServerFrame) -> SendResult {
        let sender = match self.connections.get(id) {
            Some(entry) => entry.sender.clone(),
            None => {
                debug!(conn = %id, "Recipient not connected");
                return SendResult::NotConnected;
            }
        };

        match sender.try_send(frame) {
            Ok(()) => SendResult::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(conn = %id, "Outbound queue full, applying backpressure");
                SendResult::ChannelFull
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(conn = %id, "Outbound queue closed, connection may have dropped");
                self.unregister(id);
                SendResult::ChannelClosed
            }
        }
    }

    /// Snapshot a connection.
    pub fn info(&self, id: &ConnectionId) -> Option<ConnectionInfo> {
        self.connections.get(id).map(|entry| ConnectionInfo {
            id: *id,
            state: entry.state,
            room: entry.room.clone(),
            last_seen: entry.last_seen,
        })
    }

    /// Check if a connection is registered.
    pub fn is_connected(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    /// Get the number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Remove all connections whose outbound queue has been dropped or
    /// that have been idle longer than the idle timeout.
    ///
    /// Catches transports that went away without a clean unregister, and
    /// half-open peers that stopped talking. Returns the removed ids.
    pub fn cleanup_stale(&self) -> Vec<ConnectionId> {
        let cutoff = self
            .idle_timeout
            .and_then(|idle| chrono::Duration::from_std(idle).ok())
            .map(|idle| Utc::now() - idle);

        let stale: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| {
                let entry = entry.value();
                entry.sender.is_closed() || cutoff.is_some_and(|cutoff| entry.last_seen < cutoff)
            })
            .map(|entry| *entry.key())
            .collect();

        let removed: Vec<ConnectionId> = stale
            .into_iter()
            .filter(|id| self.unregister(id).is_some())
            .collect();

        if !removed.is_empty() {
            info!(count = removed.len(), "Cleaned up stale connections");
        }
        removed
    }

    fn remove_member(&self, room: &RoomId, id: &ConnectionId) {
        if let Some(mut members) = self.rooms.get_mut(room) {
            members.remove(id);
        }
        self.rooms.remove_if(room, |_, members| members.is_empty());
    }

    fn emit(&self, event: PresenceEvent) {
        // No subscribers is fine.
        let _ = self.presence_tx.send(event);
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connection_count", &self.connections.len())
            .field("room_count", &self.rooms.len())
            .finish()
    }
}
