//! Delivery channel abstraction.
//!
//! A delivery channel is a per-conversation subscription that carries
//! acknowledged submissions outward and unacknowledged pushes inward.
//! Implementations:
//! - [`ws::WsConnector`]: JSON frames over a WebSocket
//! - [`loopback::LoopbackConnector`]: in-process server for testing

pub mod loopback;
pub mod ws;

use std::time::Duration;

use tokio::sync::mpsc;

use dmchat_proto::frame::FrameError;
use dmchat_proto::message::{AckPayload, ConversationId, EventName, Message, MessageId, Offset};

/// Stream of messages pushed by the server for one subscription.
///
/// Closes when the channel disconnects.
pub type Inbound = mpsc::Receiver<Message>;

/// Errors that can occur on a delivery channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The channel is not connected, or the connection was lost while
    /// waiting for an acknowledgment.
    #[error("connection closed")]
    ConnectionClosed,

    /// No acknowledgment arrived within the timeout.
    #[error("no acknowledgment within {0:?}")]
    Timeout(Duration),

    /// The server acknowledged without assigning an id.
    #[error("server did not confirm the message: {0}")]
    Rejected(String),

    /// The server could not be reached.
    #[error("{url} is unreachable")]
    Unreachable {
        /// Address that was dialed.
        url: String,
    },

    /// A frame could not be encoded or decoded.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// An underlying I/O error occurred.
    #[error("channel I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    /// Whether a later attempt on the same channel could succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Rejected(_))
    }
}

/// Successful acknowledgment of one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    /// Id the server assigned to the persisted message.
    pub message_id: MessageId,
}

impl TryFrom<AckPayload> for Ack {
    type Error = ChannelError;

    /// An acknowledgment only counts when it carries an id.
    fn try_from(payload: AckPayload) -> Result<Self, Self::Error> {
        match payload.sent_msg {
            Some(sent) => Ok(Self {
                message_id: sent.id,
            }),
            None => Err(ChannelError::Rejected(
                payload.error.unwrap_or_else(|| "acknowledgment without id".into()),
            )),
        }
    }
}

/// A live subscription to one conversation.
pub trait DeliveryChannel: Send + Sync {
    /// Conversation this channel is subscribed to.
    fn conversation(&self) -> &ConversationId;

    /// Submit `message` on `event` and wait up to `timeout` for the
    /// acknowledgment.
    fn send(
        &self,
        event: &EventName,
        message: &Message,
        timeout: Duration,
    ) -> impl std::future::Future<Output = Result<Ack, ChannelError>> + Send;

    /// Whether the underlying connection is up.
    fn is_connected(&self) -> bool;

    /// Tear the subscription down.
    ///
    /// Synchronous so that switching conversations can drop the old
    /// subscription before the new one is requested. The inbound stream
    /// closes and later sends fail with [`ChannelError::ConnectionClosed`].
    fn disconnect(&self);
}

/// Opens delivery channels.
pub trait ChannelConnector: Send + Sync {
    /// Channel type produced by this connector.
    type Channel: DeliveryChannel + 'static;

    /// Subscribe to `conversation`, passing `resume` as the resume hint.
    fn connect(
        &self,
        conversation: &ConversationId,
        resume: &Offset,
    ) -> impl std::future::Future<Output = Result<(Self::Channel, Inbound), ChannelError>> + Send;
}
