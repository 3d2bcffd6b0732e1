//! In-memory conversation store.
//!
//! The [`ConversationStore`] keeps every conversation's messages oldest
//! first and assigns strictly increasing ids on append. Submissions that
//! carry a client nonce are persisted once: a retry of the same submission
//! gets the id of the first copy back.

use std::collections::{BTreeMap, HashMap};

use dmchat_proto::api::{self, ConversationInfo, ConversationSummary};
use dmchat_proto::message::{ConversationId, Message, MessageExt, MessageId, Offset};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Default number of messages per history page.
pub const DEFAULT_PAGE_SIZE: usize = 20;

/// Result of appending a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Appended {
    /// The persisted message, carrying its id.
    pub message: Message,
    /// Whether an earlier attempt of the same submission was already stored.
    pub duplicate: bool,
}

#[derive(Debug, Default)]
struct Conversation {
    title: Option<String>,
    messages: Vec<Message>,
    nonces: HashMap<Uuid, MessageId>,
}

impl Conversation {
    fn title_or_default(&self, id: &ConversationId) -> String {
        self.title
            .clone()
            .unwrap_or_else(|| format!("Conversation {id}"))
    }
}

#[derive(Debug, Default)]
struct Inner {
    conversations: BTreeMap<ConversationId, Conversation>,
    next_id: u64,
}

/// Thread-safe store of every conversation.
///
/// Conversations are created on first use; [`ConversationStore::create`]
/// only sets a title.
pub struct ConversationStore {
    inner: RwLock<Inner>,
    page_size: usize,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    /// Creates an empty store with the default page size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    /// Creates an empty store with a custom page size.
    #[must_use]
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            page_size: page_size.max(1),
        }
    }

    /// Messages per history page.
    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    /// Creates `conversation` or renames it.
    pub async fn create(&self, conversation: &ConversationId, title: impl Into<String>) {
        let mut inner = self.inner.write().await;
        inner
            .conversations
            .entry(conversation.clone())
            .or_default()
            .title = Some(title.into());
    }

    /// Persists `message` in `conversation` and assigns it the next id.
    ///
    /// Retry metadata is stripped from the stored copy. If the message
    /// carries a nonce seen before in this conversation, nothing is stored
    /// and the earlier copy is returned.
    pub async fn append(&self, conversation: &ConversationId, message: Message) -> Appended {
        let mut inner = self.inner.write().await;
        let next_id = inner.next_id + 1;
        let entry = inner
            .conversations
            .entry(conversation.clone())
            .or_default();

        let nonce = message.ext.client_nonce;
        if let Some(existing) = nonce
            .and_then(|n| entry.nonces.get(&n))
            .and_then(|id| entry.messages.iter().find(|m| m.id.as_ref() == Some(id)))
        {
            return Appended {
                message: existing.clone(),
                duplicate: true,
            };
        }

        let id = MessageId::new(next_id.to_string());
        let stored = Message {
            id: Some(id.clone()),
            content: message.content,
            sender_username: message.sender_username,
            ext: MessageExt::default(),
        };
        entry.messages.push(stored.clone());
        if let Some(nonce) = nonce {
            entry.nonces.insert(nonce, id);
        }
        inner.next_id = next_id;

        Appended {
            message: stored,
            duplicate: false,
        }
    }

    /// One history page, newest first.
    pub async fn page(&self, conversation: &ConversationId, offset: &Offset) -> Vec<Message> {
        let inner = self.inner.read().await;
        inner
            .conversations
            .get(conversation)
            .map(|c| api::select_page(&c.messages, offset, self.page_size))
            .unwrap_or_default()
    }

    /// Messages a reconnecting subscriber missed, oldest first.
    ///
    /// `Latest` means the subscriber holds nothing locally and replays
    /// nothing; history pages cover it. Otherwise every message after the
    /// resume id is returned, capped to the newest page. An unknown resume
    /// id replays the newest page.
    pub async fn missed_since(&self, conversation: &ConversationId, resume: &Offset) -> Vec<Message> {
        let Offset::Before(resume_id) = resume else {
            return Vec::new();
        };
        let inner = self.inner.read().await;
        let Some(entry) = inner.conversations.get(conversation) else {
            return Vec::new();
        };
        let start = entry
            .messages
            .iter()
            .position(|m| m.id.as_ref() == Some(resume_id))
            .map_or(0, |pos| pos + 1);
        let missed = &entry.messages[start..];
        let skip = missed.len().saturating_sub(self.page_size);
        missed[skip..].to_vec()
    }

    /// Title of `conversation`.
    pub async fn info(&self, conversation: &ConversationId) -> ConversationInfo {
        let inner = self.inner.read().await;
        let msg_title = inner.conversations.get(conversation).map_or_else(
            || format!("Conversation {conversation}"),
            |c| c.title_or_default(conversation),
        );
        ConversationInfo { msg_title }
    }

    /// Every known conversation, ordered by id.
    pub async fn list(&self) -> Vec<ConversationSummary> {
        let inner = self.inner.read().await;
        inner
            .conversations
            .iter()
            .map(|(id, c)| ConversationSummary {
                id: id.clone(),
                msg_title: c.title_or_default(id),
            })
            .collect()
    }

    /// Number of messages stored in `conversation`.
    pub async fn len(&self, conversation: &ConversationId) -> usize {
        let inner = self.inner.read().await;
        inner
            .conversations
            .get(conversation)
            .map_or(0, |c| c.messages.len())
    }
}
