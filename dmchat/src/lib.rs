//! Direct-message client core.
//!
//! Keeps one conversation view consistent while messages arrive from three
//! sources: paginated history, live pushes on the delivery channel, and the
//! user's own acknowledged sends. The [`engine`] merges them; the
//! [`session`] task drives it from async I/O.

pub mod api;
pub mod channel;
pub mod config;
pub mod engine;
pub mod history;
pub mod log;
pub mod pipeline;
pub mod session;
