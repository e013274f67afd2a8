//! Broker facade.
//!
//! Owns the registry, sequencer, broadcast engine and session store and runs
//! one worker task per room. The worker is the only place a room's messages
//! are sequenced, recorded and published, so each publish completes before
//! the next message in that room is sequenced. Joins and reconnects go
//! through the same worker, which keeps replay batches ordered ahead of live
//! deliveries. Presence notifications for a room are published by the same
//! worker, so a stalled member only ever holds up its own room. Workers stop
//! after sitting idle and are started again on demand.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

use crate::broadcast::{BroadcastEngine, DeliveryReport};
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::protocol::ServerFrame;
use crate::registry::{ConnectionRegistry, SendResult};
use crate::sequencer::MessageSequencer;
use crate::session::{InMemorySessionStore, ReplayBatch, SessionStore};
use crate::types::{ConnectionId, ConnectionState, Message, PresenceEvent, RawMessage, RoomId, SessionId};

/// Queued commands per room worker.
const ROOM_QUEUE_CAPACITY: usize = 1024;

/// Capacity of the delivered-message notification channel.
const DELIVERY_CHANNEL_CAPACITY: usize = 1024;

/// Result of a successful submit.
#[derive(Debug, Clone)]
pub struct Published {
    /// The sequenced message
    pub message: Arc<Message>,
    /// Per-recipient outcome of the fan-out
    pub report: DeliveryReport,
}

/// Commands processed by a room worker, in arrival order.
enum RoomCommand {
    Submit {
        raw: RawMessage,
        reply: oneshot::Sender<Result<Published, BrokerError>>,
    },
    Join {
        connection: ConnectionId,
        reply: oneshot::Sender<Result<(), BrokerError>>,
    },
    Reconnect {
        session_id: SessionId,
        connection: ConnectionId,
        last_seq: u64,
        reply: oneshot::Sender<Result<ReplayBatch, BrokerError>>,
    },
    Presence {
        event: PresenceEvent,
    },
}

/// Components shared between the facade and its tasks.
struct Core {
    registry: Arc<ConnectionRegistry>,
    sequencer: MessageSequencer,
    sessions: Arc<dyn SessionStore>,
    engine: BroadcastEngine,
    deliveries: broadcast::Sender<Arc<Message>>,
    /// Command queues of the running room workers
    rooms: DashMap<RoomId, mpsc::Sender<RoomCommand>>,
    room_idle_timeout: Duration,
    shutdown: CancellationToken,
}

impl Core {
    /// Command queue of the room's worker, starting one if none is running.
    fn room_worker(self: &Arc<Self>, room: &RoomId) -> mpsc::Sender<RoomCommand> {
        self.rooms
            .entry(room.clone())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(ROOM_QUEUE_CAPACITY);
                let worker = RoomWorker {
                    room: room.clone(),
                    core: Arc::clone(self),
                };
                let span = info_span!("room_worker", room = %room);
                tokio::spawn(worker.run(rx).instrument(span));
                debug!(room = %room, "Spawned room worker");
                tx
            })
            .clone()
    }

    /// Hand a presence change to the worker of the room it concerns.
    ///
    /// Never waits on the worker, so one busy room cannot hold up presence
    /// in the others.
    fn route_presence(self: &Arc<Self>, event: PresenceEvent) {
        let Some(room) = event.room.clone() else {
            return;
        };
        let audience = self.registry.list_by_room(&room);
        if audience.iter().all(|id| *id == event.connection) {
            return;
        }

        let worker = self.room_worker(&room);
        match worker.try_send(RoomCommand::Presence { event }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(command)) => {
                debug!(room = %room, "Room queue full, deferring presence");
                tokio::spawn(async move {
                    let _ = worker.send(command).await;
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Queue a frame, detaching the connection's session if its transport
    /// turned out to be gone.
    async fn send_or_detach(&self, connection: ConnectionId, frame: ServerFrame) {
        let kind = frame.kind();
        match self.registry.send_to(&connection, frame) {
            SendResult::Sent => {}
            SendResult::ChannelClosed => {
                warn!(conn = %connection, frame = kind, "Transport gone while queuing session frame");
                if let Err(e) = self.sessions.detach(&connection).await {
                    warn!(conn = %connection, error = %e, "Failed to detach session");
                }
            }
            result => {
                warn!(conn = %connection, frame = kind, ?result, "Failed to queue session frame");
            }
        }
    }

    /// Send the session handshake followed by the replay (or gap) frame.
    async fn acknowledge(&self, session_id: SessionId, connection: ConnectionId, batch: &ReplayBatch) {
        let handshake = ServerFrame::Session {
            session_id,
            conn_id: connection,
        };
        for frame in [handshake, batch.to_frame()] {
            self.send_or_detach(connection, frame).await;
        }
    }

    /// Detach the session of a connection that is no longer registered.
    async fn detach_closed(&self, connection: &ConnectionId) {
        if self.registry.is_connected(connection) {
            // Still registered; it only left a room.
            return;
        }
        if let Err(e) = self.sessions.detach(connection).await {
            warn!(conn = %connection, error = %e, "Failed to detach session");
        }
    }

    /// One sweeper pass: expire sessions, drop stale connections and detach
    /// any session whose connection vanished.
    async fn sweep(&self) {
        match self.sessions.sweep_expired().await {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "Swept expired sessions"),
            Err(e) => error!(error = %e, "Session sweep failed"),
        }

        for connection in self.registry.cleanup_stale() {
            if let Err(e) = self.sessions.detach(&connection).await {
                warn!(conn = %connection, error = %e, "Failed to detach session");
            }
        }

        let registry = &self.registry;
        match self
            .sessions
            .detach_orphans(&|connection: &ConnectionId| registry.is_connected(connection))
            .await
        {
            Ok(0) => {}
            Ok(detached) => debug!(detached, "Detached orphaned sessions"),
            Err(e) => error!(error = %e, "Orphan sweep failed"),
        }
    }
}

/// The chat transport core.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct Broker {
    config: BrokerConfig,
    core: Arc<Core>,
}

impl Broker {
    /// Create a broker with the in-memory session store.
    pub fn new(config: BrokerConfig) -> Self {
        let sessions: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new(
            config.replay_buffer_size,
            config.session_grace_period(),
        ));
        Self::with_session_store(config, sessions)
    }

    /// Create a broker backed by the given session store.
    pub fn with_session_store(config: BrokerConfig, sessions: Arc<dyn SessionStore>) -> Self {
        let registry = Arc::new(
            ConnectionRegistry::new(config.max_connections, config.max_connections_per_room)
                .with_idle_timeout(config.connection_idle_timeout()),
        );
        let engine = BroadcastEngine::new(
            Arc::clone(&registry),
            Arc::clone(&sessions),
            config.delivery_timeout(),
            config.max_consecutive_failures,
        );
        let (deliveries, _) = broadcast::channel(DELIVERY_CHANNEL_CAPACITY);

        info!(
            max_connections = config.max_connections,
            replay_buffer_size = config.replay_buffer_size,
            "Broker created"
        );

        Self {
            core: Arc::new(Core {
                registry,
                sequencer: MessageSequencer::new(config.auto_create_rooms),
                sessions,
                engine,
                deliveries,
                rooms: DashMap::new(),
                room_idle_timeout: config.room_idle_timeout(),
                shutdown: CancellationToken::new(),
            }),
            config,
        }
    }

    /// Broker configuration.
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// The connection registry.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.core.registry
    }

    /// The message sequencer.
    pub fn sequencer(&self) -> &MessageSequencer {
        &self.core.sequencer
    }

    /// The session store.
    pub fn sessions(&self) -> &dyn SessionStore {
        self.core.sessions.as_ref()
    }

    /// Number of running room workers.
    pub fn active_rooms(&self) -> usize {
        self.core.rooms.len()
    }

    // ========================================================================
    // Connections
    // ========================================================================

    /// Register a new transport.
    ///
    /// Returns the connection id and the receiving end of its outbound frame
    /// queue. The transport drains the receiver; dropping it closes the
    /// connection.
    pub fn connect(&self) -> Result<(ConnectionId, mpsc::Receiver<ServerFrame>), BrokerError> {
        self.ensure_running()?;
        let (tx, rx) = mpsc::channel(self.config.outbound_queue_capacity);
        let id = self.core.registry.register(tx)?;
        self.core.registry.set_presence(&id, ConnectionState::Open)?;
        Ok((id, rx))
    }

    /// Tear down a connection and detach its session, if any.
    ///
    /// Idempotent.
    #[instrument(skip(self), fields(conn = %connection))]
    pub async fn disconnect(&self, connection: &ConnectionId) -> Result<Option<SessionId>, BrokerError> {
        let removed = self.core.registry.unregister(connection);
        let session = self.core.sessions.detach(connection).await?;
        if removed.is_some() {
            info!(session = ?session, "Connection closed");
        }
        Ok(session)
    }

    /// Update a connection's liveness state.
    pub fn set_presence(&self, connection: &ConnectionId, state: ConnectionState) -> Result<(), BrokerError> {
        self.core.registry.set_presence(connection, state)
    }

    /// Refresh a connection's last-seen timestamp.
    pub fn touch(&self, connection: &ConnectionId) -> bool {
        self.core.registry.touch(connection)
    }

    /// Move a connection into a room.
    ///
    /// Binds the connection's session, if any, so it buffers the room's
    /// messages from here on.
    pub async fn join(&self, connection: &ConnectionId, room: &RoomId) -> Result<(), BrokerError> {
        self.core.sequencer.ensure_room(room)?;
        let connection = *connection;
        self.dispatch(room, |reply| RoomCommand::Join { connection, reply })
            .await
    }

    // ========================================================================
    // Messages
    // ========================================================================

    /// Sequence a message, record it for sessions and deliver it to the room.
    pub async fn submit(
        &self,
        room: &RoomId,
        user: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<Published, BrokerError> {
        self.core.sequencer.ensure_room(room)?;
        let raw = RawMessage::new(user, text);
        self.dispatch(room, |reply| RoomCommand::Submit { raw, reply })
            .await
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Create a detached session for `user`.
    pub async fn create_session(&self, user: &str) -> Result<SessionId, BrokerError> {
        self.ensure_running()?;
        self.core.sessions.create_session(user).await
    }

    /// Create a session for `user` and attach `connection` to it.
    ///
    /// The session binds to the connection's current room, if any, and a
    /// `session` frame is queued to the connection.
    #[instrument(skip(self), fields(conn = %connection))]
    pub async fn open_session(&self, connection: &ConnectionId, user: &str) -> Result<SessionId, BrokerError> {
        let info = self
            .core
            .registry
            .info(connection)
            .ok_or(BrokerError::ConnectionNotFound(*connection))?;

        let session_id = self.create_session(user).await?;
        self.core.sessions.attach(&session_id, *connection, 0).await?;
        if let Some(room) = &info.room {
            self.core.sessions.bind_room(&session_id, room).await?;
        }

        self.core
            .send_or_detach(
                *connection,
                ServerFrame::Session {
                    session_id,
                    conn_id: *connection,
                },
            )
            .await;
        info!(session = %session_id, "Session opened");
        Ok(session_id)
    }

    /// Reattach a session to a new connection.
    ///
    /// The connection rejoins the session's room and receives a `session`
    /// frame followed by a `replay` frame holding everything after
    /// `last_seq`, or `replayGap` when that history aged out. Later
    /// deliveries in the room queue up behind the replay.
    #[instrument(skip(self), fields(session = %session_id, conn = %connection))]
    pub async fn reconnect(
        &self,
        session_id: &SessionId,
        connection: &ConnectionId,
        last_seq: u64,
    ) -> Result<ReplayBatch, BrokerError> {
        self.ensure_running()?;
        let info = self
            .core
            .sessions
            .describe(session_id)
            .await
            .ok_or(BrokerError::SessionExpired(*session_id))?;

        let (session_id, connection) = (*session_id, *connection);
        let batch = match info.room {
            Some(room) => {
                self.dispatch(&room, |reply| RoomCommand::Reconnect {
                    session_id,
                    connection,
                    last_seq,
                    reply,
                })
                .await?
            }
            None => {
                let batch = self
                    .core
                    .sessions
                    .attach(&session_id, connection, last_seq)
                    .await?;
                self.core.acknowledge(session_id, connection, &batch).await;
                batch
            }
        };

        info!(gap = batch.is_gap(), replayed = batch.sequences().len(), "Session reattached");
        Ok(batch)
    }

    /// End a session explicitly. Returns whether it existed.
    pub async fn logout(&self, session_id: &SessionId) -> Result<bool, BrokerError> {
        self.core.sessions.end_session(session_id).await
    }

    /// Session attached to a connection.
    pub async fn session_for(&self, connection: &ConnectionId) -> Option<SessionId> {
        self.core.sessions.session_for(connection).await
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Receive every message after it was published.
    pub fn subscribe_deliveries(&self) -> broadcast::Receiver<Arc<Message>> {
        self.core.deliveries.subscribe()
    }

    /// Receive every presence change.
    pub fn subscribe_presence(&self) -> broadcast::Receiver<PresenceEvent> {
        self.core.registry.subscribe_presence()
    }

    /// Invoke `callback` for every published message until shutdown.
    pub fn on_deliver<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Message>) + Send + 'static,
    {
        spawn_listener(
            "deliver",
            self.subscribe_deliveries(),
            self.core.shutdown.clone(),
            callback,
        )
    }

    /// Invoke `callback` for every presence change until shutdown.
    pub fn on_presence_change<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(PresenceEvent) + Send + 'static,
    {
        spawn_listener(
            "presence",
            self.subscribe_presence(),
            self.core.shutdown.clone(),
            callback,
        )
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the presence pump and the expiry sweeper.
    ///
    /// The pump hands presence changes to the room workers and detaches the
    /// sessions of closed connections. The sweeper destroys expired sessions,
    /// drops connections whose transport vanished or went quiet, and detaches
    /// sessions the pump missed.
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        vec![self.spawn_presence_pump(), self.spawn_sweeper()]
    }

    fn spawn_presence_pump(&self) -> JoinHandle<()> {
        let core = Arc::clone(&self.core);
        let shutdown = self.core.shutdown.clone();
        let mut events = core.registry.subscribe_presence();

        tokio::spawn(
            async move {
                loop {
                    let event = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        event = events.recv() => event,
                    };
                    match event {
                        Ok(event) => {
                            if event.state == ConnectionState::Closed {
                                core.detach_closed(&event.connection).await;
                            }
                            core.route_presence(event);
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            // The sweeper detaches whatever sessions these carried.
                            warn!(skipped, "Presence pump lagged");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
                debug!("Presence pump stopped");
            }
            .instrument(info_span!("presence_pump")),
        )
    }

    fn spawn_sweeper(&self) -> JoinHandle<()> {
        let core = Arc::clone(&self.core);
        let shutdown = self.core.shutdown.clone();
        let period = self.config.session_sweep_interval();

        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    core.sweep().await;
                }
                debug!("Sweeper stopped");
            }
            .instrument(info_span!("session_sweeper")),
        )
    }

    /// Stop room workers and background tasks.
    ///
    /// Pending and later calls fail with [`BrokerError::Shutdown`].
    pub fn shutdown(&self) {
        info!(rooms = self.core.rooms.len(), "Broker shutting down");
        self.core.shutdown.cancel();
        self.core.rooms.clear();
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    pub fn is_shutdown(&self) -> bool {
        self.core.shutdown.is_cancelled()
    }

    fn ensure_running(&self) -> Result<(), BrokerError> {
        if self.core.shutdown.is_cancelled() {
            return Err(BrokerError::Shutdown);
        }
        Ok(())
    }

    async fn dispatch<T>(
        &self,
        room: &RoomId,
        command: impl FnOnce(oneshot::Sender<Result<T, BrokerError>>) -> RoomCommand,
    ) -> Result<T, BrokerError> {
        self.ensure_running()?;
        let worker = self.core.room_worker(room);
        let (reply, response) = oneshot::channel();
        worker
            .send(command(reply))
            .await
            .map_err(|_| BrokerError::Shutdown)?;
        response.await.map_err(|_| BrokerError::Shutdown)?
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.core.shutdown.cancel();
        self.core.rooms.clear();
    }
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("config", &self.config)
            .field("room_workers", &self.core.rooms.len())
            .field("registry", &self.core.registry)
            .finish()
    }
}

/// Serializes everything that touches one room's sequence space.
struct RoomWorker {
    room: RoomId,
    core: Arc<Core>,
}

impl RoomWorker {
    async fn run(self, mut commands: mpsc::Receiver<RoomCommand>) {
        let shutdown = self.core.shutdown.clone();
        let idle = self.core.room_idle_timeout;
        loop {
            let command = tokio::select! {
                _ = shutdown.cancelled() => break,
                command = tokio::time::timeout(idle, commands.recv()) => match command {
                    Ok(Some(command)) => command,
                    Ok(None) => break,
                    Err(_) if self.retire(&commands) => break,
                    Err(_) => continue,
                },
            };

            match command {
                RoomCommand::Submit { raw, reply } => {
                    let _ = reply.send(self.submit(raw).await);
                }
                RoomCommand::Join { connection, reply } => {
                    let _ = reply.send(self.join(connection).await);
                }
                RoomCommand::Reconnect {
                    session_id,
                    connection,
                    last_seq,
                    reply,
                } => {
                    let _ = reply.send(self.reconnect(session_id, connection, last_seq).await);
                }
                RoomCommand::Presence { event } => {
                    self.core.engine.publish_presence(&event).await;
                }
            }
        }
        debug!("Room worker stopped");
    }

    /// Remove this worker from the room map if nothing is queued and no
    /// caller holds its queue. The room's sequence counter is untouched, so
    /// a replacement worker carries on where this one stopped.
    fn retire(&self, commands: &mpsc::Receiver<RoomCommand>) -> bool {
        let retired = self
            .core
            .rooms
            .remove_if(&self.room, |_, sender| {
                sender.strong_count() == 1 && commands.is_empty()
            })
            .is_some();
        if retired {
            debug!("Room worker idle, retiring");
        }
        retired
    }

    async fn submit(&self, raw: RawMessage) -> Result<Published, BrokerError> {
        let message = Arc::new(self.core.sequencer.sequence(&self.room, raw)?);

        if let Err(e) = self.core.sessions.record(&self.room, &message).await {
            error!(seq = message.seq, error = %e, "Failed to record message for replay");
        }

        let report = self.core.engine.publish(&message).await;
        // No subscribers is fine.
        let _ = self.core.deliveries.send(Arc::clone(&message));

        Ok(Published { message, report })
    }

    async fn join(&self, connection: ConnectionId) -> Result<(), BrokerError> {
        self.core.registry.join(&connection, &self.room)?;
        if let Some(session_id) = self.core.sessions.session_for(&connection).await {
            self.core.sessions.bind_room(&session_id, &self.room).await?;
        }
        Ok(())
    }

    async fn reconnect(
        &self,
        session_id: SessionId,
        connection: ConnectionId,
        last_seq: u64,
    ) -> Result<ReplayBatch, BrokerError> {
        self.core.registry.join(&connection, &self.room)?;
        let batch = match self.core.sessions.attach(&session_id, connection, last_seq).await {
            Ok(batch) => batch,
            Err(e) => {
                self.core.registry.leave(&connection);
                return Err(e);
            }
        };
        self.core.acknowledge(session_id, connection, &batch).await;
        Ok(batch)
    }
}

fn spawn_listener<T, F>(
    name: &'static str,
    mut events: broadcast::Receiver<T>,
    shutdown: CancellationToken,
    callback: F,
) -> JoinHandle<()>
where
    T: Clone + Send + 'static,
    F: Fn(T) + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(event) => callback(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(listener = name, skipped, "Listener lagged, events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;
    use std::sync::Mutex;
    use std::time::Duration;

    fn broker() -> Broker {
        Broker::new(BrokerConfig::default())
    }

    fn general() -> RoomId {
        RoomId::new("general")
    }

    async fn recv(rx: &mut mpsc::Receiver<ServerFrame>) -> ServerFrame {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("outbound queue closed")
    }

    /// Wait for a presence frame about `conn`, skipping everything else.
    async fn recv_presence(
        rx: &mut mpsc::Receiver<ServerFrame>,
        conn: ConnectionId,
    ) -> ConnectionState {
        loop {
            if let ServerFrame::Presence { conn_id, state } = recv(rx).await {
                if conn_id == conn {
                    return state;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_submit_assigns_sequence() {
        let broker = broker();

        let first = broker.submit(&general(), "alice", "hi").await.unwrap();
        let second = broker.submit(&general(), "alice", "again").await.unwrap();

        assert_eq!(first.message.seq, 1);
        assert_eq!(second.message.seq, 2);
        assert!(first.report.is_empty());
        assert_eq!(broker.sequencer().current_sequence(&general()), Some(2));
    }

    #[tokio::test]
    async fn test_join_then_receive() {
        let broker = broker();
        let (conn, mut rx) = broker.connect().unwrap();
        broker.join(&conn, &general()).await.unwrap();

        let published = broker.submit(&general(), "alice", "hello").await.unwrap();

        assert_eq!(published.report.delivered, vec![conn]);
        assert_eq!(recv(&mut rx).await, ServerFrame::deliver(&published.message));
    }

    #[tokio::test]
    async fn test_unknown_room_without_auto_create() {
        let broker = Broker::new(BrokerConfig {
            auto_create_rooms: false,
            ..Default::default()
        });
        let (conn, _rx) = broker.connect().unwrap();

        let err = broker.submit(&general(), "alice", "hi").await.unwrap_err();
        assert!(matches!(err, BrokerError::RoomNotFound(_)));
        let err = broker.join(&conn, &general()).await.unwrap_err();
        assert!(matches!(err, BrokerError::RoomNotFound(_)));

        broker.sequencer().initialize_room(&general());
        broker.join(&conn, &general()).await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_respects_capacity() {
        let broker = Broker::new(BrokerConfig {
            max_connections: 1,
            ..Default::default()
        });
        let (first, _rx) = broker.connect().unwrap();

        assert!(matches!(
            broker.connect().unwrap_err(),
            BrokerError::CapacityExceeded(_)
        ));

        broker.disconnect(&first).await.unwrap();
        assert!(broker.connect().is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let broker = broker();
        let (conn, _rx) = broker.connect().unwrap();
        let session = broker.open_session(&conn, "bob").await.unwrap();

        assert_eq!(broker.disconnect(&conn).await.unwrap(), Some(session));
        assert_eq!(broker.disconnect(&conn).await.unwrap(), None);
        assert_eq!(broker.registry().connection_count(), 0);
    }

    #[tokio::test]
    async fn test_open_session_sends_handshake() {
        let broker = broker();
        let (conn, mut rx) = broker.connect().unwrap();

        let session_id = broker.open_session(&conn, "bob").await.unwrap();

        assert_eq!(
            recv(&mut rx).await,
            ServerFrame::Session {
                session_id,
                conn_id: conn
            }
        );
        assert_eq!(broker.session_for(&conn).await, Some(session_id));
    }

    #[tokio::test]
    async fn test_reconnect_replays_then_delivers_live() {
        let broker = broker();
        let (old, _old_rx) = broker.connect().unwrap();
        let session_id = broker.open_session(&old, "bob").await.unwrap();
        broker.join(&old, &general()).await.unwrap();

        broker.submit(&general(), "alice", "one").await.unwrap();
        broker.disconnect(&old).await.unwrap();
        broker.submit(&general(), "alice", "two").await.unwrap();
        broker.submit(&general(), "alice", "three").await.unwrap();

        let (new, mut rx) = broker.connect().unwrap();
        let batch = broker.reconnect(&session_id, &new, 1).await.unwrap();
        assert_eq!(batch.sequences(), vec![2, 3]);

        broker.submit(&general(), "alice", "four").await.unwrap();

        assert!(matches!(recv(&mut rx).await, ServerFrame::Session { .. }));
        match recv(&mut rx).await {
            ServerFrame::Replay { messages } => {
                let seqs: Vec<u64> = messages.iter().map(|m| m.seq).collect();
                assert_eq!(seqs, vec![2, 3]);
            }
            other => panic!("expected replay, got {:?}", other),
        }
        match recv(&mut rx).await {
            ServerFrame::Deliver(payload) => assert_eq!(payload.seq, 4),
            other => panic!("expected deliver, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reconnect_without_room() {
        let broker = broker();
        let session_id = broker.create_session("bob").await.unwrap();
        let (conn, mut rx) = broker.connect().unwrap();

        let batch = broker.reconnect(&session_id, &conn, 0).await.unwrap();

        assert_eq!(batch, ReplayBatch::Messages(Vec::new()));
        assert!(matches!(recv(&mut rx).await, ServerFrame::Session { .. }));
        assert_eq!(recv(&mut rx).await, ServerFrame::Replay { messages: Vec::new() });
    }

    #[tokio::test]
    async fn test_reconnect_after_logout_fails() {
        let broker = broker();
        let session_id = broker.create_session("bob").await.unwrap();
        assert!(broker.logout(&session_id).await.unwrap());

        let (conn, _rx) = broker.connect().unwrap();
        let err = broker.reconnect(&session_id, &conn, 0).await.unwrap_err();
        assert!(matches!(err, BrokerError::SessionExpired(_)));
    }

    #[tokio::test]
    async fn test_on_deliver_callback() {
        let broker = broker();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, mut done_rx) = mpsc::channel(8);

        let sink = Arc::clone(&seen);
        broker.on_deliver(move |message| {
            sink.lock().unwrap().push(message.seq);
            let _ = done_tx.try_send(());
        });

        broker.submit(&general(), "alice", "one").await.unwrap();
        broker.submit(&general(), "alice", "two").await.unwrap();

        for _ in 0..2 {
            tokio::time::timeout(Duration::from_secs(1), done_rx.recv())
                .await
                .unwrap();
        }
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_presence_pump_notifies_room() {
        let broker = broker();
        broker.spawn_background();

        let (a, _a_rx) = broker.connect().unwrap();
        let (b, mut b_rx) = broker.connect().unwrap();
        broker.join(&a, &general()).await.unwrap();
        broker.join(&b, &general()).await.unwrap();

        broker.set_presence(&a, ConnectionState::Closing).unwrap();

        // A's own join may or may not reach B first.
        let mut state = recv_presence(&mut b_rx, a).await;
        if state == ConnectionState::Open {
            state = recv_presence(&mut b_rx, a).await;
        }
        assert_eq!(state, ConnectionState::Closing);
    }

    #[tokio::test]
    async fn test_join_announces_newcomer_to_room() {
        let broker = broker();
        broker.spawn_background();
        let (a, mut a_rx) = broker.connect().unwrap();
        broker.join(&a, &general()).await.unwrap();

        let (b, _b_rx) = broker.connect().unwrap();
        broker.join(&b, &general()).await.unwrap();

        assert_eq!(
            recv(&mut a_rx).await,
            ServerFrame::Presence {
                conn_id: b,
                state: ConnectionState::Open
            }
        );
    }

    #[tokio::test]
    async fn test_moving_rooms_closes_presence_in_old_room() {
        let broker = broker();
        broker.spawn_background();
        let (a, mut a_rx) = broker.connect().unwrap();
        broker.join(&a, &general()).await.unwrap();
        let (b, _b_rx) = broker.connect().unwrap();
        let session_id = broker.open_session(&b, "bob").await.unwrap();
        broker.join(&b, &general()).await.unwrap();
        assert_eq!(recv_presence(&mut a_rx, b).await, ConnectionState::Open);

        broker.join(&b, &RoomId::new("random")).await.unwrap();

        assert_eq!(recv_presence(&mut a_rx, b).await, ConnectionState::Closed);
        assert!(broker.registry().list_by_room(&general()).iter().all(|id| *id != b));
        // Only the room changed; the session stays attached.
        let info = broker.sessions().describe(&session_id).await.unwrap();
        assert_eq!(info.state, SessionState::Active);
        assert_eq!(info.room, Some(RoomId::new("random")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_room_does_not_delay_presence_elsewhere() {
        let broker = Broker::new(BrokerConfig {
            outbound_queue_capacity: 1,
            delivery_timeout_ms: 1_500,
            ..Default::default()
        });
        broker.spawn_background();

        let (watcher, mut watcher_rx) = broker.connect().unwrap();
        broker.join(&watcher, &general()).await.unwrap();
        let (subject, _subject_rx) = broker.connect().unwrap();
        broker.join(&subject, &general()).await.unwrap();
        assert_eq!(recv_presence(&mut watcher_rx, subject).await, ConnectionState::Open);

        // The stalled member never drains; the mover's join fills its queue
        // and the next presence change in "slow" blocks on it.
        let slow = RoomId::new("slow");
        let (stalled, _stalled_rx) = broker.connect().unwrap();
        broker.join(&stalled, &slow).await.unwrap();
        let (mover, _mover_rx) = broker.connect().unwrap();
        broker.join(&mover, &slow).await.unwrap();
        broker.set_presence(&mover, ConnectionState::Closing).unwrap();

        let start = tokio::time::Instant::now();
        broker.set_presence(&subject, ConnectionState::Closing).unwrap();
        let state = tokio::time::timeout(
            Duration::from_secs(5),
            recv_presence(&mut watcher_rx, subject),
        )
        .await
        .unwrap();

        assert_eq!(state, ConnectionState::Closing);
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_room_worker_retires_and_restarts() {
        let broker = Broker::new(BrokerConfig {
            room_idle_timeout_ms: 1_000,
            ..Default::default()
        });
        broker.submit(&general(), "alice", "one").await.unwrap();
        assert_eq!(broker.active_rooms(), 1);

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(broker.active_rooms(), 0);

        // The sequence carries on in the replacement worker.
        let next = broker.submit(&general(), "alice", "two").await.unwrap();
        assert_eq!(next.message.seq, 2);
        assert_eq!(broker.active_rooms(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_room_worker_is_kept() {
        let broker = Broker::new(BrokerConfig {
            room_idle_timeout_ms: 1_000,
            ..Default::default()
        });
        for _ in 0..4 {
            broker.submit(&general(), "alice", "ping").await.unwrap();
            tokio::time::sleep(Duration::from_millis(600)).await;
        }
        assert_eq!(broker.active_rooms(), 1);
        assert_eq!(broker.sequencer().current_sequence(&general()), Some(4));
    }

    #[tokio::test]
    async fn test_sweeper_detaches_session_of_dropped_transport() {
        let broker = Broker::new(BrokerConfig {
            session_sweep_interval_ms: 10,
            ..Default::default()
        });
        let (conn, rx) = broker.connect().unwrap();
        let session_id = broker.open_session(&conn, "bob").await.unwrap();
        broker.spawn_background();

        drop(rx);

        tokio::time::timeout(Duration::from_secs(1), async {
            while broker.registry().is_connected(&conn)
                || broker.session_for(&conn).await.is_some()
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let info = broker.sessions().describe(&session_id).await.unwrap();
        assert_eq!(info.state, SessionState::Detached);
    }

    #[tokio::test]
    async fn test_presence_pump_detaches_evicted_sessions() {
        let broker = broker();
        broker.spawn_background();
        let (conn, _rx) = broker.connect().unwrap();
        let session_id = broker.open_session(&conn, "bob").await.unwrap();

        // Removed behind the broker's back, e.g. by a failed direct send.
        broker.registry().unregister(&conn);

        tokio::time::timeout(Duration::from_secs(1), async {
            while broker.session_for(&conn).await.is_some() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            broker.sessions().describe(&session_id).await.unwrap().connection,
            None
        );
    }

    #[tokio::test]
    async fn test_shutdown_rejects_calls() {
        let broker = broker();
        broker.submit(&general(), "alice", "hi").await.unwrap();

        broker.shutdown();

        assert!(broker.is_shutdown());
        assert!(matches!(
            broker.submit(&general(), "alice", "late").await.unwrap_err(),
            BrokerError::Shutdown
        ));
        assert!(matches!(broker.connect().unwrap_err(), BrokerError::Shutdown));
    }
}
