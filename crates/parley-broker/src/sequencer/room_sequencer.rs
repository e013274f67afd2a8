use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, error, info, instrument};

use crate::error::BrokerError;
use crate::metrics;
use crate::types::{Message, RawMessage, RoomId};

/// Highest sequence number a room may issue (2^63 - 1).
pub const MAX_SEQUENCE: u64 = i64::MAX as u64;

/// Sequence state for one room.
#[derive(Debug)]
struct RoomCounter {
    /// Last issued sequence number; 0 before the first message
    last: AtomicU64,
    /// Set once the counter overflowed; never cleared
    halted: AtomicBool,
}

impl RoomCounter {
    fn starting_after(last: u64) -> Self {
        Self {
            last: AtomicU64::new(last),
            halted: AtomicBool::new(false),
        }
    }
}

/// Per-room sequence number authority.
pub struct MessageSequencer {
    rooms: DashMap<RoomId, Arc<RoomCounter>>,
    auto_create: bool,
}

impl MessageSequencer {
    /// Create a sequencer. With `auto_create` disabled, rooms must be
    /// initialized before messages can be sequenced in them.
    pub fn new(auto_create: bool) -> Self {
        Self {
            rooms: DashMap::new(),
            auto_create,
        }
    }

    /// Initialize a room starting at sequence 1. No-op if it exists.
    pub fn initialize_room(&self, room: &RoomId) {
        self.initialize_room_from(room, 0);
    }

    /// Initialize a room whose last issued sequence number is `last_seq`.
    ///
    /// Used to restore a known high-water mark. No-op if the room exists.
    #[instrument(skip(self), fields(room = %room))]
    pub fn initialize_room_from(&self, room: &RoomId, last_seq: u64) {
        self.rooms.entry(room.clone()).or_insert_with(|| {
            info!(last_seq, "Initialized room sequencer");
            Arc::new(RoomCounter::starting_after(last_seq))
        });
    }

    /// Check that a room can be sequenced, creating it if auto-creation is on.
    pub fn ensure_room(&self, room: &RoomId) -> Result<(), BrokerError> {
        self.counter(room).map(|_| ())
    }

    /// Whether the room has been initialized.
    pub fn room_exists(&self, room: &RoomId) -> bool {
        self.rooms.contains_key(room)
    }

    /// Last sequence number issued in a room.
    pub fn current_sequence(&self, room: &RoomId) -> Option<u64> {
        self.rooms
            .get(room)
            .map(|counter| counter.last.load(Ordering::Acquire))
    }

    /// Whether a room was halted by counter overflow.
    pub fn is_halted(&self, room: &RoomId) -> bool {
        self.rooms
            .get(room)
            .is_some_and(|counter| counter.halted.load(Ordering::Acquire))
    }

    /// Get the number of initialized rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Assign the next sequence number in `room` to `raw`.
    ///
    /// Overflow past [`MAX_SEQUENCE`] halts the room permanently.
    pub fn sequence(&self, room: &RoomId, raw: RawMessage) -> Result<Message, BrokerError> {
        let counter = self.counter(room)?;

        if counter.halted.load(Ordering::Acquire) {
            return Err(BrokerError::RoomHalted(room.clone()));
        }

        let next = counter
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                last.checked_add(1).filter(|next| *next <= MAX_SEQUENCE)
            });

        let seq = match next {
            Ok(previous) => previous + 1,
            Err(_) => {
                counter.halted.store(true, Ordering::Release);
                error!(room = %room, "Sequence counter overflow, halting room");
                return Err(BrokerError::SequenceOverflow(room.clone()));
            }
        };

        debug!(room = %room, seq, "Sequenced message");
        metrics::record_message_sequenced();

        Ok(Message {
            room: room.clone(),
            user: raw.user,
            text: raw.text,
            seq,
            timestamp: Utc::now(),
        })
    }

    fn counter(&self, room: &RoomId) -> Result<Arc<RoomCounter>, BrokerError> {
        if let Some(counter) = self.rooms.get(room) {
            return Ok(Arc::clone(counter.value()));
        }
        if !self.auto_create {
            return Err(BrokerError::RoomNotFound(room.clone()));
        }
        let counter = self
            .rooms
            .entry(room.clone())
            .or_insert_with(|| {
                info!(room = %room, "Auto-created room sequencer");
                Arc::new(RoomCounter::starting_after(0))
            })
            .value()
            .clone();
        Ok(counter)
    }
}

impl fmt::Debug for MessageSequencer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageSequencer")
            .field("room_count", &self.rooms.len())
            .field("auto_create", &self.auto_create)
            .finish()
    }
}
