//! `dmchat` reference server library.
//!
//! Serves conversation history over HTTP and a per-conversation delivery
//! channel over WebSocket. Exposed for use in tests and embedding.

pub mod config;
pub mod server;
pub mod store;
