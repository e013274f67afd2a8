//! Broker metrics for observability.
//!
//! Uses the global OpenTelemetry meter provider. Until the host application
//! installs one, every instrument is a no-op.

use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

static METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    METER.get_or_init(|| opentelemetry::global::meter("parley-broker"))
}

// ============================================================================
// Counters (Cumulative)
// ============================================================================

/// Counter for messages assigned a sequence number.
pub fn messages_sequenced() -> Counter<u64> {
    meter()
        .u64_counter("parley.messages.sequenced")
        .with_description("Total messages assigned a sequence number")
        .with_unit("message")
        .build()
}

/// Counter for per-recipient delivery attempts.
pub fn deliveries() -> Counter<u64> {
    meter()
        .u64_counter("parley.deliveries")
        .with_description("Total per-recipient delivery attempts by outcome")
        .with_unit("delivery")
        .build()
}

/// Counter for recipients evicted after repeated delivery failures.
pub fn evictions() -> Counter<u64> {
    meter()
        .u64_counter("parley.evictions")
        .with_description("Total recipients evicted for repeated delivery failures")
        .with_unit("connection")
        .build()
}

/// Counter for reattaches that could not be replayed in full.
pub fn replay_gaps() -> Counter<u64> {
    meter()
        .u64_counter("parley.sessions.replay_gaps")
        .with_description("Total reattaches whose missed history had aged out")
        .with_unit("session")
        .build()
}

// ============================================================================
// Gauges (Current State)
// ============================================================================

/// Gauge for registered connections.
pub fn connections_active() -> Gauge<i64> {
    meter()
        .i64_gauge("parley.connections.active")
        .with_description("Current number of registered connections")
        .with_unit("connection")
        .build()
}

/// Gauge for stored sessions.
pub fn sessions_active() -> Gauge<i64> {
    meter()
        .i64_gauge("parley.sessions.active")
        .with_description("Current number of stored sessions")
        .with_unit("session")
        .build()
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Record a message being sequenced.
///
/// Room names are client-chosen, so they are never used as a label.
pub fn record_message_sequenced() {
    messages_sequenced().add(1, &[]);
}

/// Record the outcome of one delivery.
pub fn record_delivery(frame: &str, outcome: &str) {
    deliveries().add(
        1,
        &[
            KeyValue::new("frame", frame.to_string()),
            KeyValue::new("outcome", outcome.to_string()),
        ],
    );
}

/// Record a recipient eviction.
pub fn record_eviction() {
    evictions().add(1, &[]);
}

/// Record a replay gap.
pub fn record_replay_gap() {
    replay_gaps().add(1, &[]);
}

/// Record connection count change.
pub fn record_connections_active(count: usize) {
    connections_active().record(count as i64, &[]);
}

/// Record session count change.
pub fn record_sessions_active(count: usize) {
    sessions_active().record(count as i64, &[]);
}
