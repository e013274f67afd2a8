//! Message Sequencer.
//!
//! The single authority for per-room sequence numbers. Each room owns one
//! counter; assignment is an atomic checked increment, so concurrent
//! submissions to the same room never share or skip a number while other
//! rooms proceed independently.

mod room_sequencer;

pub use room_sequencer::{MessageSequencer, MAX_SEQUENCE};
