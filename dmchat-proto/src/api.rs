//! HTTP API response bodies.
//!
//! Every endpoint wraps its payload in `{ "data": ... }`.

use serde::{Deserialize, Serialize};

use crate::message::{ConversationId, Message, Offset};

/// Path prefix of the history endpoint; the conversation id follows.
pub const HISTORY_PATH: &str = "/api/msg/privateMsg";

/// Path prefix of the conversation info endpoint; the conversation id follows.
pub const INFO_PATH: &str = "/api/msg/privateMsgInfo";

/// Path of the conversation list endpoint.
pub const LIST_PATH: &str = "/api/msg/privateMsgList";

/// Path of the identity endpoint.
pub const WHOAMI_PATH: &str = "/api/user/whoami";

/// Header carrying the caller's username.
pub const USER_HEADER: &str = "x-dmchat-user";

/// Cookie carrying the caller's username.
pub const USER_COOKIE: &str = "dmchat_user";

/// Envelope around every API payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// The payload.
    pub data: T,
}

impl<T> ApiResponse<T> {
    /// Wraps a payload.
    pub const fn new(data: T) -> Self {
        Self { data }
    }
}

/// History page body, newest first.
pub type HistoryPage = ApiResponse<Vec<Message>>;

/// The logged-in user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Username.
    pub username: String,
    /// Discriminator tag shown as `username#tag`.
    pub tag: String,
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.username, self.tag)
    }
}

/// Display metadata for one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationInfo {
    /// Title shown above the message list.
    pub msg_title: String,
}

/// One entry of the conversation list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    /// Conversation id.
    pub id: ConversationId,
    /// Title of the conversation.
    pub msg_title: String,
}

/// Selects one history page from an oldest-first message list.
///
/// `Offset::Latest` selects the newest `page_size` messages;
/// `Offset::Before(id)` selects up to `page_size` messages strictly older
/// than `id`. The page is returned newest first. An offset naming an
/// unknown message yields an empty page.
#[must_use]
pub fn select_page(messages: &[Message], offset: &Offset, page_size: usize) -> Vec<Message> {
    let end = match offset {
        Offset::Latest => messages.len(),
        Offset::Before(id) => {
            match messages.iter().position(|m| m.id.as_ref() == Some(id)) {
                Some(pos) => pos,
                None => return Vec::new(),
            }
        }
    };
    let start = end.saturating_sub(page_size);
    messages[start..end].iter().rev().cloned().collect()
}
