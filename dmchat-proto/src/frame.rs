//! Delivery channel frames.
//!
//! Frames travel as WebSocket text messages encoded as JSON with a `type`
//! tag. A client submits a message with [`Frame::Emit`] and a fresh
//! `ack_id`; the server answers with a [`Frame::Ack`] carrying the same
//! `ack_id`. New messages from other participants arrive as
//! [`Frame::Push`] and are never acknowledged.

use serde::{Deserialize, Serialize};

use crate::message::{AckPayload, ConversationId, EventName, Message, Offset};

/// Query parameter naming the conversation on connect.
pub const QUERY_CONVERSATION: &str = "privateMsgId";

/// Query parameter carrying the resume offset on connect.
pub const QUERY_OFFSET: &str = "privateMsgOffset";

/// One frame on the delivery channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Client submits a message and expects an [`Frame::Ack`].
    Emit {
        /// Event the message is submitted on.
        event: EventName,
        /// Correlation id echoed by the acknowledgment.
        ack_id: u64,
        /// The submitted message.
        data: Message,
    },
    /// Server acknowledges one [`Frame::Emit`].
    Ack {
        /// Correlation id of the acknowledged submission.
        ack_id: u64,
        /// Acknowledgment body.
        data: AckPayload,
    },
    /// Server pushes a message created by another participant.
    Push {
        /// Event the message belongs to.
        event: EventName,
        /// The pushed message.
        data: Message,
    },
}

/// Error type for frame encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// JSON encoding or decoding failed.
    #[error("frame serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encodes a frame as JSON text.
///
/// # Errors
///
/// Returns [`FrameError::Json`] if serialization fails.
pub fn encode(frame: &Frame) -> Result<String, FrameError> {
    Ok(serde_json::to_string(frame)?)
}

/// Decodes a frame from JSON text.
///
/// # Errors
///
/// Returns [`FrameError::Json`] for malformed or unknown frames.
pub fn decode(text: &str) -> Result<Frame, FrameError> {
    Ok(serde_json::from_str(text)?)
}

/// Builds the connect query string for a conversation subscription.
#[must_use]
pub fn connect_query(conversation: &ConversationId, resume: &Offset) -> Vec<(&'static str, String)> {
    vec![
        (QUERY_CONVERSATION, conversation.to_string()),
        (QUERY_OFFSET, resume.to_string()),
    ]
}
