//! Broadcast Engine.
//!
//! Fans a sequenced message out to every live member of its room. Each
//! recipient gets its own bounded send; a slow, closed or cancelled recipient
//! shows up as a [`DeliveryFailure`] in the [`DeliveryReport`] and never
//! holds up the others. Recipients that keep failing are evicted.

mod engine;
mod report;

pub use engine::BroadcastEngine;
pub use report::{DeliveryFailure, DeliveryReport, FailureReason};
