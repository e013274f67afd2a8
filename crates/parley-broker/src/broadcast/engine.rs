use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, instrument, warn};

use super::{DeliveryFailure, DeliveryReport, FailureReason};
use crate::metrics;
use crate::protocol::ServerFrame;
use crate::registry::{ConnectionRegistry, Recipient};
use crate::session::SessionStore;
use crate::types::{ConnectionId, Message, PresenceEvent, RoomId};

/// Fans out frames to room members with per-recipient failure isolation.
pub struct BroadcastEngine {
    registry: Arc<ConnectionRegistry>,
    sessions: Arc<dyn SessionStore>,
    delivery_timeout: Duration,
    max_consecutive_failures: u32,
}

impl BroadcastEngine {
    /// Create an engine delivering through `registry`.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        sessions: Arc<dyn SessionStore>,
        delivery_timeout: Duration,
        max_consecutive_failures: u32,
    ) -> Self {
        Self {
            registry,
            sessions,
            delivery_timeout,
            max_consecutive_failures,
        }
    }

    /// Deliver a sequenced message to every live member of its room.
    ///
    /// Returns once every recipient has either accepted the frame or failed.
    /// Callers that await each publish before the next get per-recipient
    /// delivery in sequence order.
    #[instrument(skip(self, message), fields(room = %message.room, seq = message.seq))]
    pub async fn publish(&self, message: &Message) -> DeliveryReport {
        let report = self
            .fan_out(
                message.room.clone(),
                Some(message.seq),
                ServerFrame::deliver(message),
                None,
            )
            .await;

        debug!(
            delivered = report.delivered.len(),
            failed = report.failures.len(),
            evicted = report.evicted.len(),
            "Published message"
        );
        report
    }

    /// Tell the other members of a room that a connection's presence changed.
    ///
    /// Returns `None` when the connection was not in a room.
    pub async fn publish_presence(&self, event: &PresenceEvent) -> Option<DeliveryReport> {
        let room = event.room.clone()?;
        let frame = ServerFrame::Presence {
            conn_id: event.connection,
            state: event.state,
        };
        Some(self.fan_out(room, None, frame, Some(event.connection)).await)
    }

    async fn fan_out(
        &self,
        room: RoomId,
        seq: Option<u64>,
        frame: ServerFrame,
        exclude: Option<ConnectionId>,
    ) -> DeliveryReport {
        let recipients: Vec<Recipient> = self
            .registry
            .recipients(&room)
            .into_iter()
            .filter(|r| Some(r.id) != exclude)
            .collect();

        let kind = frame.kind();
        let timeout = self.delivery_timeout;
        let outcomes = join_all(recipients.into_iter().map(|recipient| {
            let frame = frame.clone();
            async move {
                let outcome = deliver(&recipient, frame, timeout).await;
                (recipient, outcome)
            }
        }))
        .await;

        let mut report = DeliveryReport::new(room, seq);
        for (recipient, outcome) in outcomes {
            match outcome {
                Ok(()) => {
                    recipient.consecutive_failures.store(0, Ordering::Release);
                    metrics::record_delivery(kind, "delivered");
                    report.delivered.push(recipient.id);
                }
                Err(reason) => {
                    metrics::record_delivery(kind, &reason.to_string());
                    report.failures.push(DeliveryFailure {
                        connection: recipient.id,
                        reason,
                    });
                    if self.should_evict(&recipient, reason) {
                        self.evict(&recipient.id, reason).await;
                        report.evicted.push(recipient.id);
                    }
                }
            }
        }
        report
    }

    fn should_evict(&self, recipient: &Recipient, reason: FailureReason) -> bool {
        match reason {
            // Already unregistered by whoever cancelled it.
            FailureReason::Cancelled => false,
            // The transport is gone; nothing left to retry.
            FailureReason::Closed => true,
            FailureReason::TimedOut => {
                let failures = recipient
                    .consecutive_failures
                    .fetch_add(1, Ordering::AcqRel)
                    .saturating_add(1);
                debug!(conn = %recipient.id, failures, "Delivery timed out");
                failures > self.max_consecutive_failures
            }
        }
    }

    async fn evict(&self, id: &ConnectionId, reason: FailureReason) {
        warn!(conn = %id, %reason, "Evicting unresponsive recipient");
        self.registry.unregister(id);
        if let Err(e) = self.sessions.detach(id).await {
            warn!(conn = %id, error = %e, "Failed to detach session of evicted recipient");
        }
        metrics::record_eviction();
    }
}

/// Send one frame to one recipient, bounded by `timeout` and cancelled if
/// the connection is unregistered meanwhile.
async fn deliver(
    recipient: &Recipient,
    frame: ServerFrame,
    timeout: Duration,
) -> Result<(), FailureReason> {
    tokio::select! {
        biased;
        _ = recipient.cancel.cancelled() => Err(FailureReason::Cancelled),
        result = tokio::time::timeout(timeout, recipient.sender.send(frame)) => match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(FailureReason::Closed),
            Err(_) => Err(FailureReason::TimedOut),
        },
    }
}

impl fmt::Debug for BroadcastEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastEngine")
            .field("delivery_timeout", &self.delivery_timeout)
            .field("max_consecutive_failures", &self.max_consecutive_failures)
            .finish()
    }
}
