//! Message types for the dmchat direct-message protocol.
//!
//! These types are shared by the client and the reference server. JSON field
//! names follow the wire contract (`senderUsername`, `ext.retryTimes`,
//! `sentMsg.id`), so every struct here uses camelCase renaming.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum message content length, counted in UTF-16 code units.
pub const MAX_CONTENT_LEN: usize = 5000;

/// Default number of retries granted to an outgoing message.
pub const DEFAULT_RETRY_TIMES: i32 = 3;

/// Prefix of the per-conversation delivery event name.
const PRIVATE_MSG_EVENT_PREFIX: &str = "privateMsgEvent_";

/// Prefix of the per-conversation initial-sync event name.
const PRIVATE_MSG_INIT_EVENT_PREFIX: &str = "privateMsgInitEvent_";

/// Opaque key identifying one direct-message thread.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// Creates a conversation identifier from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string form of this identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Server-assigned message identifier.
///
/// Clients treat the value as opaque. The reference server assigns
/// increasing decimal integers but only ever compares them for equality,
/// locating a cursor by the message's position in the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Creates a message identifier from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string form of this identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Retry metadata attached to an outgoing message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessageExt {
    /// Remaining retries before the sender abandons the message.
    pub retry_times: i32,
    /// Idempotency key shared by every attempt of the same submission.
    pub client_nonce: Option<Uuid>,
}

/// A direct message.
///
/// `id` is `None` while the message is speculative (composed locally and
/// not yet acknowledged). Once the server assigns an id the message is
/// canonical and must not change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Server-assigned identifier.
    #[serde(default)]
    pub id: Option<MessageId>,
    /// Message text.
    pub content: String,
    /// Display name of the sender.
    pub sender_username: String,
    /// Retry metadata.
    #[serde(default)]
    pub ext: MessageExt,
}

impl Message {
    /// Creates a speculative message with no server id.
    pub fn speculative(content: impl Into<String>, sender_username: impl Into<String>) -> Self {
        Self {
            id: None,
            content: content.into(),
            sender_username: sender_username.into(),
            ext: MessageExt::default(),
        }
    }

    /// Creates a confirmed message carrying a server id.
    pub fn confirmed(
        id: impl Into<String>,
        content: impl Into<String>,
        sender_username: impl Into<String>,
    ) -> Self {
        Self {
            id: Some(MessageId::new(id)),
            content: content.into(),
            sender_username: sender_username.into(),
            ext: MessageExt::default(),
        }
    }

    /// Whether the server has assigned an id to this message.
    #[must_use]
    pub const fn is_confirmed(&self) -> bool {
        self.id.is_some()
    }

    /// Validates the content for sending.
    ///
    /// # Errors
    ///
    /// See [`validate_content`].
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_content(&self.content)
    }
}

/// Error returned when outgoing content fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Content is empty.
    #[error("message content is empty")]
    Empty,
    /// Content exceeds [`MAX_CONTENT_LEN`].
    #[error("message too long ({len} units, max {max})")]
    TooLong {
        /// Actual length in UTF-16 code units.
        len: usize,
        /// Maximum allowed length.
        max: usize,
    },
}

/// Checks that `text` is non-empty and at most [`MAX_CONTENT_LEN`] UTF-16
/// code units long.
///
/// # Errors
///
/// Returns [`ValidationError::Empty`] or [`ValidationError::TooLong`].
pub fn validate_content(text: &str) -> Result<(), ValidationError> {
    if text.is_empty() {
        return Err(ValidationError::Empty);
    }
    let len = text.encode_utf16().count();
    if len > MAX_CONTENT_LEN {
        return Err(ValidationError::TooLong {
            len,
            max: MAX_CONTENT_LEN,
        });
    }
    Ok(())
}

/// Pagination cursor for history requests.
///
/// On the wire `Latest` is the sentinel `-1`; any other value is the id of
/// the oldest message already loaded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum Offset {
    /// Request the newest page.
    #[default]
    Latest,
    /// Request the page immediately older than this message.
    Before(MessageId),
}

impl Offset {
    /// Wire value of the `Latest` sentinel.
    pub const LATEST_SENTINEL: &'static str = "-1";

    /// Returns the message id this cursor points at, if any.
    #[must_use]
    pub const fn message_id(&self) -> Option<&MessageId> {
        match self {
            Self::Latest => None,
            Self::Before(id) => Some(id),
        }
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => f.write_str(Self::LATEST_SENTINEL),
            Self::Before(id) => write!(f, "{id}"),
        }
    }
}

impl FromStr for Offset {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s == Self::LATEST_SENTINEL {
            Ok(Self::Latest)
        } else {
            Ok(Self::Before(MessageId::new(s)))
        }
    }
}

impl From<Option<MessageId>> for Offset {
    fn from(id: Option<MessageId>) -> Self {
        id.map_or(Self::Latest, Self::Before)
    }
}

/// Event identifier used to multiplex conversations over one connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventName(String);

impl EventName {
    /// Delivery event for a conversation: `privateMsgEvent_<id>`.
    #[must_use]
    pub fn for_conversation(conversation: &ConversationId) -> Self {
        Self(format!("{PRIVATE_MSG_EVENT_PREFIX}{conversation}"))
    }

    /// Initial-sync event for a conversation: `privateMsgInitEvent_<id>`.
    #[must_use]
    pub fn init_for(conversation: &ConversationId) -> Self {
        Self(format!("{PRIVATE_MSG_INIT_EVENT_PREFIX}{conversation}"))
    }

    /// Recovers the conversation id from a delivery event name.
    #[must_use]
    pub fn conversation(&self) -> Option<ConversationId> {
        self.0
            .strip_prefix(PRIVATE_MSG_EVENT_PREFIX)
            .filter(|id| !id.is_empty())
            .map(ConversationId::new)
    }

    /// Returns the string form of this event name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of the persisted message inside an acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentMsg {
    /// Server-assigned id.
    pub id: MessageId,
}

/// Payload carried by a delivery acknowledgment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
    /// The persisted message, present on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_msg: Option<SentMsg>,
    /// Server-side rejection reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AckPayload {
    /// Successful acknowledgment carrying the persisted id.
    #[must_use]
    pub const fn sent(id: MessageId) -> Self {
        Self {
            sent_msg: Some(SentMsg { id }),
            error: None,
        }
    }

    /// Rejection with a reason.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            sent_msg: None,
            error: Some(reason.into()),
        }
    }

    /// Returns the persisted id, if the acknowledgment carries one.
    #[must_use]
    pub fn message_id(&self) -> Option<&MessageId> {
        self.sent_msg.as_ref().map(|sent| &sent.id)
    }
}
