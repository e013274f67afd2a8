//! Test utilities for driving a broker without a network transport.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parley_broker::{Broker, BrokerConfig, ConnectionId, ConnectionState, RoomId, ServerFrame};
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Initialize tracing once per test binary.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("info")
            .with_test_writer()
            .try_init();
    });
}

/// Start a broker with its background tasks running.
pub fn start_broker(config: BrokerConfig) -> Arc<Broker> {
    init_tracing();
    let broker = Arc::new(Broker::new(config));
    broker.spawn_background();
    broker
}

/// The room used by most tests.
pub fn general() -> RoomId {
    RoomId::new("general")
}

/// A connected client: its id and the outbound frames the broker queued.
pub struct TestClient {
    pub id: ConnectionId,
    pub frames: mpsc::Receiver<ServerFrame>,
}

impl TestClient {
    pub fn connect(broker: &Broker) -> Self {
        let (id, frames) = broker.connect().expect("connect failed");
        Self { id, frames }
    }

    /// Wait for the next frame.
    pub async fn next_frame(&mut self) -> ServerFrame {
        timeout(DEFAULT_TIMEOUT, self.frames.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("outbound queue closed")
    }

    /// Wait for the next frame that is not a presence notification.
    pub async fn next_non_presence(&mut self) -> ServerFrame {
        loop {
            match self.next_frame().await {
                ServerFrame::Presence { .. } => continue,
                frame => return frame,
            }
        }
    }

    /// Wait for the next `deliver` frame, skipping presence notifications.
    pub async fn next_delivery(&mut self) -> (u64, String) {
        loop {
            match self.next_frame().await {
                ServerFrame::Deliver(payload) => return (payload.seq, payload.text),
                ServerFrame::Presence { .. } => continue,
                other => panic!("expected deliver frame, got {:?}", other),
            }
        }
    }

    /// Wait for the next presence frame about `conn`, skipping other frames.
    pub async fn next_presence(&mut self, conn: ConnectionId) -> ConnectionState {
        loop {
            if let ServerFrame::Presence { conn_id, state } = self.next_frame().await {
                if conn_id == conn {
                    return state;
                }
            }
        }
    }

    /// Discard everything queued so far. Returns how many frames were dropped.
    pub fn drain(&mut self) -> usize {
        let mut dropped = 0;
        while self.frames.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }

    /// Collect every `deliver` sequence number queued so far.
    pub fn queued_deliveries(&mut self) -> Vec<u64> {
        let mut seqs = Vec::new();
        while let Ok(frame) = self.frames.try_recv() {
            if let ServerFrame::Deliver(payload) = frame {
                seqs.push(payload.seq);
            }
        }
        seqs
    }
}
