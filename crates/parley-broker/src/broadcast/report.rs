use std::fmt;

use crate::types::{ConnectionId, RoomId};

/// Why a delivery to one recipient did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The outbound queue stayed full for the whole delivery timeout
    TimedOut,
    /// The outbound queue was closed by the transport
    Closed,
    /// The connection was unregistered while the delivery was in flight
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::TimedOut => write!(f, "timed_out"),
            FailureReason::Closed => write!(f, "closed"),
            FailureReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A per-recipient delivery failure. Recorded, never raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryFailure {
    /// The recipient
    pub connection: ConnectionId,
    /// What went wrong
    pub reason: FailureReason,
}

/// Outcome of one publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Room the frame was published to
    pub room: RoomId,
    /// Sequence number of the message, `None` for presence frames
    pub seq: Option<u64>,
    /// Recipients whose queue accepted the frame
    pub delivered: Vec<ConnectionId>,
    /// Recipients that failed this time
    pub failures: Vec<DeliveryFailure>,
    /// Recipients removed for exceeding the consecutive failure threshold
    pub evicted: Vec<ConnectionId>,
}

impl DeliveryReport {
    /// Create an empty report.
    pub fn new(room: RoomId, seq: Option<u64>) -> Self {
        Self {
            room,
            seq,
            delivered: Vec::new(),
            failures: Vec::new(),
            evicted: Vec::new(),
        }
    }

    /// Number of recipients attempted.
    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.failures.len()
    }

    /// True when nobody was attempted.
    pub fn is_empty(&self) -> bool {
        self.attempted() == 0 && self.evicted.is_empty()
    }

    /// True when at least one recipient failed.
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}
