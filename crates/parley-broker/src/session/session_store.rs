use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use super::ReplayBuffer;
use crate::error::BrokerError;
use crate::metrics;
use crate::protocol::{DeliverPayload, ServerFrame};
use crate::types::{ConnectionId, Message, RoomId, SessionId};

/// Result of reattaching a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayBatch {
    /// Every buffered message after the client's `lastSeq`, in order
    Messages(Vec<Arc<Message>>),
    /// History after `requested` aged out; the client must resync elsewhere
    Gap {
        /// The client's `lastSeq`
        requested: u64,
        /// Oldest sequence number still buffered, if any
        oldest_available: Option<u64>,
    },
}

impl ReplayBatch {
    /// Whether this is a gap indicator.
    pub fn is_gap(&self) -> bool {
        matches!(self, ReplayBatch::Gap { .. })
    }

    /// Sequence numbers in the batch (empty for a gap).
    pub fn sequences(&self) -> Vec<u64> {
        match self {
            ReplayBatch::Messages(messages) => messages.iter().map(|m| m.seq).collect(),
            ReplayBatch::Gap { .. } => Vec::new(),
        }
    }

    /// Outbound frame for the client.
    pub fn to_frame(&self) -> ServerFrame {
        match self {
            ReplayBatch::Messages(messages) => ServerFrame::Replay {
                messages: messages.iter().map(|m| DeliverPayload::from(m.as_ref())).collect(),
            },
            ReplayBatch::Gap { .. } => ServerFrame::ReplayGap,
        }
    }
}

/// Observable lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// A connection is attached
    Active,
    /// No connection attached, grace timer running
    Detached,
    /// Grace period ran out or the session was ended (terminal)
    Expired,
}

/// Snapshot of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Session id
    pub id: SessionId,
    /// Owning user label
    pub user: String,
    /// Room whose messages are buffered
    pub room: Option<RoomId>,
    /// Current lifecycle state
    pub state: SessionState,
    /// Attached connection, if active
    pub connection: Option<ConnectionId>,
    /// Number of buffered messages
    pub buffered: usize,
    /// When the session was created
    pub created_at: DateTime<Utc>,
}

/// Trait for session stores.
///
/// Implementations can be in-memory (single process) or backed by a shared
/// store (multiple broker processes).
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a session for `user`. It starts detached until attached.
    async fn create_session(&self, user: &str) -> Result<SessionId, BrokerError>;

    /// Attach a connection to a session and return what it missed after
    /// `last_seq`.
    ///
    /// Fails with `SessionExpired` for unknown or expired sessions.
    async fn attach(
        &self,
        session_id: &SessionId,
        connection: ConnectionId,
        last_seq: u64,
    ) -> Result<ReplayBatch, BrokerError>;

    /// Detach a connection from whatever session it is attached to, starting
    /// that session's grace timer. Returns the affected session.
    async fn detach(&self, connection: &ConnectionId) -> Result<Option<SessionId>, BrokerError>;

    /// Detach every session whose connection `is_registered` no longer
    /// recognizes. Returns how many were detached.
    async fn detach_orphans(
        &self,
        is_registered: &(dyn for<'c> Fn(&'c ConnectionId) -> bool + Send + Sync),
    ) -> Result<usize, BrokerError>;

    /// Append a sequenced message to every session bound to `room`.
    /// Returns how many sessions recorded it.
    async fn record(&self, room: &RoomId, message: &Arc<Message>) -> Result<usize, BrokerError>;

    /// Bind a session to the room whose messages it should buffer.
    async fn bind_room(&self, session_id: &SessionId, room: &RoomId) -> Result<(), BrokerError>;

    /// End a session explicitly (logout). Returns whether it existed.
    async fn end_session(&self, session_id: &SessionId) -> Result<bool, BrokerError>;

    /// Session the connection is attached to.
    async fn session_for(&self, connection: &ConnectionId) -> Option<SessionId>;

    /// Snapshot a session. Expired sessions report `None`.
    async fn describe(&self, session_id: &SessionId) -> Option<SessionInfo>;

    /// Destroy sessions whose grace period ran out. Returns how many.
    async fn sweep_expired(&self) -> Result<usize, BrokerError>;

    /// Get the number of stored sessions.
    async fn session_count(&self) -> usize;
}

#[derive(Debug)]
struct Session {
    id: SessionId,
    user: String,
    room: Option<RoomId>,
    buffer: ReplayBuffer,
    connection: Option<ConnectionId>,
    /// Set while detached
    detached_at: Option<Instant>,
    created_at: DateTime<Utc>,
}

impl Session {
    fn is_expired(&self, grace: Duration) -> bool {
        self.connection.is_none()
            && self
                .detached_at
                .is_some_and(|since| since.elapsed() >= grace)
    }

    fn state(&self, grace: Duration) -> SessionState {
        if self.is_expired(grace) {
            SessionState::Expired
        } else if self.connection.is_some() {
            SessionState::Active
        } else {
            SessionState::Detached
        }
    }

    fn detach_now(&mut self) {
        self.connection = None;
        self.detached_at = Some(Instant::now());
    }

    fn info(&self, grace: Duration) -> SessionInfo {
        SessionInfo {
            id: self.id,
            user: self.user.clone(),
            room: self.room.clone(),
            state: self.state(grace),
            connection: self.connection,
            buffered: self.buffer.len(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Default)]
struct SessionTable {
    sessions: HashMap<SessionId, Session>,
    /// Connection-to-session map; a connection belongs to at most one session
    by_connection: HashMap<ConnectionId, SessionId>,
    by_room: HashMap<RoomId, HashSet<SessionId>>,
}

impl SessionTable {
    fn remove(&mut self, id: &SessionId) -> Option<Session> {
        let session = self.sessions.remove(id)?;
        if let Some(connection) = &session.connection {
            self.by_connection.remove(connection);
        }
        if let Some(room) = &session.room {
            self.unindex_room(room, id);
        }
        Some(session)
    }

    fn unindex_room(&mut self, room: &RoomId, id: &SessionId) {
        if let Some(ids) = self.by_room.get_mut(room) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_room.remove(room);
            }
        }
    }

    fn remove_expired(&mut self, grace: Duration) -> usize {
        let expired: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.is_expired(grace))
            .map(|s| s.id)
            .collect();
        for id in &expired {
            self.remove(id);
        }
        expired.len()
    }
}

/// In-memory implementation of the session store.
///
/// Suitable for single-process deployments. All operations take the table
/// lock for a short, non-suspending critical section.
#[derive(Debug)]
pub struct InMemorySessionStore {
    table: RwLock<SessionTable>,
    replay_buffer_size: usize,
    grace_period: Duration,
}

impl InMemorySessionStore {
    /// Create a store with the given buffer bound and grace period.
    pub fn new(replay_buffer_size: usize, grace_period: Duration) -> Self {
        info!(
            replay_buffer_size,
            grace_ms = grace_period.as_millis() as u64,
            "Creating in-memory session store"
        );
        Self {
            table: RwLock::new(SessionTable::default()),
            replay_buffer_size,
            grace_period,
        }
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, SessionTable>, BrokerError> {
        self.table
            .write()
            .map_err(|_| BrokerError::internal("Lock poisoned"))
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    #[instrument(skip(self))]
    async fn create_session(&self, user: &str) -> Result<SessionId, BrokerError> {
        let id = SessionId::new();
        let session = Session {
            id,
            user: user.to_string(),
            room: None,
            buffer: ReplayBuffer::new(self.replay_buffer_size),
            connection: None,
            detached_at: Some(Instant::now()),
            created_at: Utc::now(),
        };

        let count = {
            let mut table = self.write()?;
            table.sessions.insert(id, session);
            table.sessions.len()
        };
        metrics::record_sessions_active(count);
        debug!(session = %id, "Created session");
        Ok(id)
    }

    #[instrument(skip(self), fields(session = %session_id, conn = %connection))]
    async fn attach(
        &self,
        session_id: &SessionId,
        connection: ConnectionId,
        last_seq: u64,
    ) -> Result<ReplayBatch, BrokerError> {
        let mut table = self.write()?;

        let expired = match table.sessions.get(session_id) {
            Some(session) => session.is_expired(self.grace_period),
            None => {
                debug!("Session not found");
                return Err(BrokerError::SessionExpired(*session_id));
            }
        };
        if expired {
            table.remove(session_id);
            debug!("Session found but expired");
            return Err(BrokerError::SessionExpired(*session_id));
        }

        // A connection belongs to at most one session.
        if let Some(other) = table.by_connection.get(&connection).copied() {
            if other != *session_id {
                if let Some(previous) = table.sessions.get_mut(&other) {
                    previous.detach_now();
                }
                debug!(previous = %other, "Moved connection away from previous session");
            }
        }

        let replaced = {
            let Some(session) = table.sessions.get_mut(session_id) else {
                return Err(BrokerError::SessionExpired(*session_id));
            };
            let replaced = session.connection.replace(connection);
            session.detached_at = None;
            replaced
        };
        if let Some(old) = replaced.filter(|old| *old != connection) {
            table.by_connection.remove(&old);
            debug!(old = %old, "Replaced previously attached connection");
        }
        table.by_connection.insert(connection, *session_id);

        let session = table
            .sessions
            .get(session_id)
            .ok_or(BrokerError::SessionExpired(*session_id))?;

        match session.buffer.since(last_seq) {
            Ok(messages) => {
                debug!(last_seq, replayed = messages.len(), "Session attached");
                Ok(ReplayBatch::Messages(messages))
            }
            Err(BrokerError::ReplayGap {
                requested,
                oldest_available,
            }) => {
                info!(last_seq, ?oldest_available, "Replay gap on attach");
                metrics::record_replay_gap();
                Ok(ReplayBatch::Gap {
                    requested,
                    oldest_available,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn detach(&self, connection: &ConnectionId) -> Result<Option<SessionId>, BrokerError> {
        let mut table = self.write()?;
        let Some(session_id) = table.by_connection.remove(connection) else {
            return Ok(None);
        };
        if let Some(session) = table.sessions.get_mut(&session_id) {
            if session.connection == Some(*connection) {
                session.detach_now();
                debug!(session = %session_id, conn = %connection, "Session detached, grace timer started");
            }
        }
        Ok(Some(session_id))
    }

    async fn detach_orphans(
        &self,
        is_registered: &(dyn for<'c> Fn(&'c ConnectionId) -> bool + Send + Sync),
    ) -> Result<usize, BrokerError> {
        let mut table = self.write()?;
        let orphans: Vec<(ConnectionId, SessionId)> = table
            .by_connection
            .iter()
            .filter(|(connection, _)| !is_registered(*connection))
            .map(|(connection, session_id)| (*connection, *session_id))
            .collect();

        for (connection, session_id) in &orphans {
            table.by_connection.remove(connection);
            if let Some(session) = table.sessions.get_mut(session_id) {
                if session.connection == Some(*connection) {
                    session.detach_now();
                }
            }
        }
        if !orphans.is_empty() {
            debug!(count = orphans.len(), "Detached sessions of vanished connections");
        }
        Ok(orphans.len())
    }

    async fn record(&self, room: &RoomId, message: &Arc<Message>) -> Result<usize, BrokerError> {
        let mut table = self.write()?;
        let ids: Vec<SessionId> = match table.by_room.get(room) {
            Some(ids) => ids.iter().copied().collect(),
            None => return Ok(0),
        };

        let mut recorded = 0;
        for id in ids {
            if let Some(session) = table.sessions.get_mut(&id) {
                session.buffer.push(Arc::clone(message));
                recorded += 1;
            }
        }
        Ok(recorded)
    }

    #[instrument(skip(self), fields(session = %session_id, room = %room))]
    async fn bind_room(&self, session_id: &SessionId, room: &RoomId) -> Result<(), BrokerError> {
        let mut table = self.write()?;
        let previous = {
            let session = table
                .sessions
                .get_mut(session_id)
                .ok_or(BrokerError::SessionExpired(*session_id))?;
            if session.room.as_ref() == Some(room) {
                return Ok(());
            }
            // A buffer only ever spans one room's sequence space.
            session.buffer = ReplayBuffer::new(self.replay_buffer_size);
            session.room.replace(room.clone())
        };

        if let Some(previous) = previous {
            table.unindex_room(&previous, session_id);
        }
        table
            .by_room
            .entry(room.clone())
            .or_default()
            .insert(*session_id);
        debug!("Session bound to room");
        Ok(())
    }

    async fn end_session(&self, session_id: &SessionId) -> Result<bool, BrokerError> {
        let (removed, count) = {
            let mut table = self.write()?;
            let removed = table.remove(session_id).is_some();
            (removed, table.sessions.len())
        };
        if removed {
            metrics::record_sessions_active(count);
            debug!(session = %session_id, "Session ended");
        }
        Ok(removed)
    }

    async fn session_for(&self, connection: &ConnectionId) -> Option<SessionId> {
        self.table
            .read()
            .ok()
            .and_then(|table| table.by_connection.get(connection).copied())
    }

    async fn describe(&self, session_id: &SessionId) -> Option<SessionInfo> {
        let table = self.table.read().ok()?;
        let session = table.sessions.get(session_id)?;
        let info = session.info(self.grace_period);
        (info.state != SessionState::Expired).then_some(info)
    }

    async fn sweep_expired(&self) -> Result<usize, BrokerError> {
        let (removed, count) = {
            let mut table = self.write()?;
            let removed = table.remove_expired(self.grace_period);
            (removed, table.sessions.len())
        };
        if removed > 0 {
            metrics::record_sessions_active(count);
            debug!(removed, remaining = count, "Cleaned up expired sessions");
        }
        Ok(removed)
    }

    async fn session_count(&self) -> usize {
        self.table.read().map(|t| t.sessions.len()).unwrap_or(0)
    }
}
