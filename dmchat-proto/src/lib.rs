//! Shared protocol definitions for the dmchat wire format.

pub mod api;
pub mod codec;
pub mod frame;
pub mod message;
