//! History fetching.
//!
//! A [`HistoryFetcher`] returns one page of a conversation's history:
//! newest first, strictly older than the offset. An empty page means the
//! beginning of the conversation has been reached.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use dmchat_proto::api::select_page;
use dmchat_proto::message::{ConversationId, Message, Offset};

use crate::api::ApiError;

/// Default number of messages per history page.
pub const DEFAULT_PAGE_SIZE: usize = 20;

/// Source of paginated conversation history.
pub trait HistoryFetcher: Send + Sync {
    /// Fetch the page preceding `offset`, newest first.
    fn fetch_page(
        &self,
        conversation: &ConversationId,
        offset: &Offset,
    ) -> impl std::future::Future<Output = Result<Vec<Message>, ApiError>> + Send;
}

/// In-memory history source.
///
/// Messages are kept oldest first per conversation and paged with the same
/// rules the server uses.
pub struct InMemoryHistory {
    conversations: Mutex<HashMap<ConversationId, Vec<Message>>>,
    page_size: usize,
    fetches: AtomicUsize,
}

impl InMemoryHistory {
    /// Create an empty history serving pages of `page_size` messages.
    #[must_use]
    pub fn new(page_size: usize) -> Self {
        Self {
            conversations: Mutex::new(HashMap::new()),
            page_size,
            fetches: AtomicUsize::new(0),
        }
    }

    /// Append a message (oldest first) to a conversation.
    pub fn push(&self, conversation: &ConversationId, message: Message) {
        self.conversations
            .lock()
            .entry(conversation.clone())
            .or_default()
            .push(message);
    }

    /// Seed a conversation with `count` messages numbered `1..=count`.
    pub fn seed(&self, conversation: &ConversationId, count: usize, sender: &str) {
        let mut conversations = self.conversations.lock();
        let messages = conversations.entry(conversation.clone()).or_default();
        for i in 1..=count {
            messages.push(Message::confirmed(i.to_string(), format!("message {i}"), sender));
        }
    }

    /// Number of pages served so far.
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryHistory {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE)
    }
}

impl HistoryFetcher for InMemoryHistory {
    async fn fetch_page(
        &self,
        conversation: &ConversationId,
        offset: &Offset,
    ) -> Result<Vec<Message>, ApiError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let conversations = self.conversations.lock();
        Ok(conversations
            .get(conversation)
            .map(|messages| select_page(messages, offset, self.page_size))
            .unwrap_or_default())
    }
}
