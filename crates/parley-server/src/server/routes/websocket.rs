//! Chat over WebSocket.
//!
//! Each socket becomes one broker connection. A writer task drains the
//! connection's outbound queue into the socket while the reader loop decodes
//! client frames and hands them to the broker; the two only meet through the
//! broker, never through shared socket state.
//!
//! The writer also pings the client at a third of the broker's connection
//! idle timeout; the pongs count as activity, so a quiet but live client is
//! never swept as idle.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use parley_broker::protocol::{decode_client_frame, encode_server_frame};
use parley_broker::{Broker, BrokerConfig, BrokerError, ClientFrame, ConnectionId, ServerFrame};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::server::AppState;

/// Subprotocol offered to clients.
pub const SUBPROTOCOL: &str = "json";

/// How long the writer may keep flushing after the reader finished.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Ping interval when the broker never sweeps idle connections.
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How often the writer pings the client.
fn heartbeat_interval(config: &BrokerConfig) -> Duration {
    config
        .connection_idle_timeout()
        .map_or(DEFAULT_HEARTBEAT_INTERVAL, |idle| idle / 3)
}

/// Create the WebSocket router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .with_state(state)
}

/// GET /ws
///
/// Upgrades the HTTP connection and runs a chat connection over it.
async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    debug!("WebSocket connection request");
    ws.protocols([SUBPROTOCOL])
        .on_upgrade(move |socket| handle_socket(socket, state))
}

/// Run one chat connection until either side closes it.
async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let broker = Arc::clone(&state.broker);

    let (conn_id, outbound) = match broker.connect() {
        Ok(connection) => connection,
        Err(e) => {
            warn!(error = %e, "Rejecting WebSocket connection");
            if let Ok(text) = encode_server_frame(&ServerFrame::error(&e)) {
                let _ = socket.send(Message::Text(text)).await;
            }
            let _ = socket.close().await;
            return;
        }
    };

    let span = info_span!("ws_connection", conn = %conn_id);
    async move {
        info!("WebSocket connection established");
        let (sink, mut stream) = socket.split();
        let heartbeat = heartbeat_interval(broker.config());
        let mut writer = tokio::spawn(write_frames(sink, outbound, heartbeat).in_current_span());

        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    broker.touch(&conn_id);
                    if let Err(e) = handle_text(&broker, conn_id, &text).await {
                        debug!(error = %e, "Client request failed");
                        broker.registry().send_to(&conn_id, ServerFrame::error(&e));
                    }
                    if !broker.registry().is_connected(&conn_id) {
                        debug!("Connection closed by client request");
                        break;
                    }
                }
                Ok(Message::Binary(_)) => {
                    warn!("Received binary WebSocket message (not supported)");
                    let e = BrokerError::protocol("binary frames are not supported");
                    broker.registry().send_to(&conn_id, ServerFrame::error(&e));
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    broker.touch(&conn_id);
                }
                Ok(Message::Close(_)) => {
                    info!("WebSocket close requested");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "WebSocket error");
                    break;
                }
            }
        }

        if let Err(e) = broker.disconnect(&conn_id).await {
            warn!(error = %e, "Failed to disconnect cleanly");
        }
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
            .await
            .is_err()
        {
            writer.abort();
        }
        info!("WebSocket connection closed");
    }
    .instrument(span)
    .await
}

/// Drain the outbound queue into the socket, pinging every `heartbeat`.
///
/// Ends when the broker drops the connection's sender or the socket fails.
async fn write_frames(
    mut sink: futures::stream::SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<ServerFrame>,
    heartbeat: Duration,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let message = tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => match encode_server_frame(&frame) {
                    Ok(text) => Message::Text(text),
                    Err(e) => {
                        error!(error = %e, frame = frame.kind(), "Failed to encode frame");
                        continue;
                    }
                },
                None => break,
            },
            _ = ticker.tick() => Message::Ping(Vec::new()),
        };
        if let Err(e) = sink.send(message).await {
            debug!(error = %e, "Failed to send WebSocket message");
            break;
        }
    }
    let _ = sink.close().await;
}

/// Dispatch one client text frame.
async fn handle_text(broker: &Broker, conn_id: ConnectionId, text: &str) -> Result<(), BrokerError> {
    match decode_client_frame(text)? {
        ClientFrame::Send { room, user, text } => {
            broker.submit(&room, user, text).await?;
        }
        ClientFrame::Hello { user } => {
            broker.open_session(&conn_id, &user).await?;
        }
        ClientFrame::Reconnect {
            session_id,
            last_seq,
        } => {
            broker.reconnect(&session_id, &conn_id, last_seq).await?;
        }
        ClientFrame::Join { room } => {
            broker.join(&conn_id, &room).await?;
        }
        ClientFrame::Presence { state } => {
            broker.set_presence(&conn_id, state)?;
        }
        ClientFrame::Logout => {
            if let Some(session_id) = broker.session_for(&conn_id).await {
                broker.logout(&session_id).await?;
            }
        }
    }
    Ok(())
}
