//! HTTP route modules.

pub mod websocket;
