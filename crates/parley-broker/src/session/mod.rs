//! Reconnection / Session Manager.
//!
//! A session is a user identity that outlives individual connections. While a
//! connection is attached the session is `active`; when it drops the session
//! becomes `detached` and a grace timer starts. Reattaching within the grace
//! period returns every buffered message the client missed; after it, the
//! session expires and its buffer is released.
//!
//! ```text
//!            attach                      grace period elapsed
//! detached ---------> active ---------> detached -------------> expired
//!     ^                         detach      |
//!     +---------------- attach -------------+
//! ```
//!
//! Storage sits behind [`SessionStore`] so a shared backend can replace the
//! in-memory one for multi-process deployments.

mod replay_buffer;
mod session_store;

pub use replay_buffer::ReplayBuffer;
pub use session_store::{
    InMemorySessionStore, ReplayBatch, SessionInfo, SessionState, SessionStore,
};
