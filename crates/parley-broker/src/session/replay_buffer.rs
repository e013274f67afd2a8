//! Bounded replay buffer for a single session.
//!
//! Holds the most recent sequenced messages of one room in FIFO order. The
//! buffer is always contiguous: the only way a message leaves is by aging out
//! of the front, and `evicted_through` remembers the highest sequence number
//! that is no longer available.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::BrokerError;
use crate::types::Message;

/// Ring of the last N sequenced messages for one session.
#[derive(Debug, Clone)]
pub struct ReplayBuffer {
    messages: VecDeque<Arc<Message>>,
    capacity: usize,
    /// Every sequence number <= this has aged out (0 = nothing lost yet)
    evicted_through: u64,
}

impl ReplayBuffer {
    /// Create a buffer holding at most `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            evicted_through: 0,
        }
    }

    /// Append a message.
    ///
    /// Messages at or below the newest buffered sequence are ignored. A
    /// message that does not directly follow the newest one discards the
    /// buffer and marks everything before it as aged out, so the buffer
    /// never holds a gap.
    pub fn push(&mut self, message: Arc<Message>) {
        let seq = message.seq;
        let newest = self.newest_sequence().unwrap_or(self.evicted_through);

        if seq <= newest {
            return;
        }

        let first_ever = self.messages.is_empty() && self.evicted_through == 0;
        if !first_ever && seq != newest + 1 {
            self.messages.clear();
            self.evicted_through = seq - 1;
        }

        if self.capacity == 0 {
            self.evicted_through = seq;
            return;
        }

        if self.messages.len() >= self.capacity {
            if let Some(evicted) = self.messages.pop_front() {
                self.evicted_through = evicted.seq;
            }
        }
        self.messages.push_back(message);
    }

    /// Messages with sequence number greater than `last_seq`, in order.
    ///
    /// Fails with `ReplayGap` when messages after `last_seq` have already
    /// aged out; never returns a partial batch.
    pub fn since(&self, last_seq: u64) -> Result<Vec<Arc<Message>>, BrokerError> {
        if last_seq < self.evicted_through {
            return Err(BrokerError::ReplayGap {
                requested: last_seq,
                oldest_available: self.oldest_sequence(),
            });
        }

        Ok(self
            .messages
            .iter()
            .filter(|m| m.seq > last_seq)
            .cloned()
            .collect())
    }

    /// Get the number of buffered messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Get the sequence number of the oldest buffered message (if any).
    pub fn oldest_sequence(&self) -> Option<u64> {
        self.messages.front().map(|m| m.seq)
    }

    /// Get the sequence number of the newest buffered message (if any).
    pub fn newest_sequence(&self) -> Option<u64> {
        self.messages.back().map(|m| m.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RoomId;
    use chrono::Utc;

    fn msg(seq: u64) -> Arc<Message> {
        Arc::new(Message {
            room: RoomId::new("general"),
            user: "alice".to_string(),
            text: format!("message {}", seq),
            seq,
            timestamp: Utc::now(),
        })
    }

    fn seqs(messages: &[Arc<Message>]) -> Vec<u64> {
        messages.iter().map(|m| m.seq).collect()
    }

    #[test]
    fn test_replay_buffer_basic() {
        let mut buffer = ReplayBuffer::new(10);
        assert!(buffer.is_empty());

        for seq in 1..=3 {
            buffer.push(msg(seq));
        }

        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.oldest_sequence(), Some(1));
        assert_eq!(buffer.newest_sequence(), Some(3));
    }

    #[test]
    fn test_since_returns_strictly_newer() {
        let mut buffer = ReplayBuffer::new(10);
        for seq in 1..=4 {
            buffer.push(msg(seq));
        }

        assert_eq!(seqs(&buffer.since(2).unwrap()), vec![3, 4]);
        assert_eq!(seqs(&buffer.since(0).unwrap()), vec![1, 2, 3, 4]);
        assert!(buffer.since(4).unwrap().is_empty());
        assert!(buffer.since(99).unwrap().is_empty());
    }

    #[test]
    fn test_eviction_is_contiguous_prefix() {
        let mut buffer = ReplayBuffer::new(3);
        for seq in 1..=5 {
            buffer.push(msg(seq));
        }

        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.oldest_sequence(), Some(3));
        // lastSeq 2 means the client needs 3.., all of which are present.
        assert_eq!(seqs(&buffer.since(2).unwrap()), vec![3, 4, 5]);
    }

    #[test]
    fn test_aged_out_request_is_a_gap() {
        let mut buffer = ReplayBuffer::new(5);
        for seq in 1..=10 {
            buffer.push(msg(seq));
        }

        match buffer.since(0) {
            Err(BrokerError::ReplayGap {
                requested,
                oldest_available,
            }) => {
                assert_eq!(requested, 0);
                assert_eq!(oldest_available, Some(6));
            }
            other => panic!("expected gap, got {:?}", other),
        }
        assert!(buffer.since(4).is_err());
        assert_eq!(seqs(&buffer.since(5).unwrap()), vec![6, 7, 8, 9, 10]);
    }

    #[test]
    fn test_first_message_may_start_mid_room() {
        let mut buffer = ReplayBuffer::new(5);
        buffer.push(msg(7));
        buffer.push(msg(8));

        // Nothing has aged out; messages before 7 were never this session's.
        assert_eq!(seqs(&buffer.since(0).unwrap()), vec![7, 8]);
    }

    #[test]
    fn test_duplicates_are_ignored() {
        let mut buffer = ReplayBuffer::new(5);
        buffer.push(msg(1));
        buffer.push(msg(2));
        buffer.push(msg(2));
        buffer.push(msg(1));

        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.newest_sequence(), Some(2));
    }

    #[test]
    fn test_discontinuity_resets_buffer() {
        let mut buffer = ReplayBuffer::new(5);
        buffer.push(msg(1));
        buffer.push(msg(2));
        buffer.push(msg(5));

        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.oldest_sequence(), Some(5));
        assert!(buffer.since(2).is_err());
        assert_eq!(seqs(&buffer.since(4).unwrap()), vec![5]);
    }

    #[test]
    fn test_zero_capacity_reports_gaps() {
        let mut buffer = ReplayBuffer::new(0);
        buffer.push(msg(1));
        buffer.push(msg(2));

        assert!(buffer.is_empty());
        assert!(buffer.since(1).is_err());
        assert!(buffer.since(2).unwrap().is_empty());
    }
}
