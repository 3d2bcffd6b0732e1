//! Reconciliation engine.
//!
//! Merges three message sources into one ordered, duplicate-free view of
//! the active conversation:
//! - history pages, prepended as the user scrolls back,
//! - pushes from other participants, appended,
//! - confirmations of the user's own sends, appended.
//!
//! The engine is synchronous and does no I/O. It hands out
//! [`FetchRequest`]s and accepts their results; every result is checked
//! against the request currently in flight, so answers that belong to a
//! previous conversation (or a superseded request) are dropped. Scroll
//! positioning is reported as [`ScrollIntent`] data for the presentation
//! layer.
//!
//! ```text
//!   Idle ──activate──▶ Loading ──page──▶ Ready(Stable) ◀──page── Ready(FetchingMore)
//!                         ▲                   │                         ▲
//!                         └────activate───────┴───────scroll top────────┘
//! ```

use std::collections::HashSet;

use dmchat_proto::message::{ConversationId, Message, MessageId, Offset};

/// Sub-state of a loaded conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// No history request in flight.
    Stable,
    /// An older page has been requested.
    FetchingMore,
}

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No conversation is active.
    Idle,
    /// Waiting for the first page of the active conversation.
    Loading,
    /// The first page has been merged.
    Ready(ReadyState),
}

/// Where the presentation layer should scroll after a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScrollIntent {
    /// Scroll to the newest message.
    Bottom,
    /// Keep this message at the same on-screen position.
    Anchor(MessageId),
}

/// A history request issued by the engine.
///
/// Results must be handed back with the same request so the engine can
/// recognise stale answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Conversation to fetch from.
    pub conversation: ConversationId,
    /// Page cursor.
    pub offset: Offset,
    /// Activation this request belongs to.
    pub epoch: u64,
}

/// Result of feeding one event to the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outcome {
    /// Whether the message list or the engine state changed.
    pub changed: bool,
    /// Scroll request for the presentation layer.
    pub scroll: Option<ScrollIntent>,
}

impl Outcome {
    const fn unchanged() -> Self {
        Self {
            changed: false,
            scroll: None,
        }
    }

    const fn changed(scroll: Option<ScrollIntent>) -> Self {
        Self {
            changed: true,
            scroll,
        }
    }
}

/// Text being composed for the active conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Composer {
    text: String,
}

impl Composer {
    /// Replace the composed text.
    pub fn set(&mut self, text: impl Into<String>) {
        self.text = text.into();
    }

    /// Current text.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Take the text for submission, leaving the composer empty.
    pub fn take(&mut self) -> String {
        std::mem::take(&mut self.text)
    }

    /// Discard the text.
    pub fn clear(&mut self) {
        self.text.clear();
    }
}

/// Ordered, deduplicated view of the active conversation.
#[derive(Debug)]
pub struct ReconciliationEngine {
    conversation: Option<ConversationId>,
    state: EngineState,
    messages: Vec<Message>,
    seen: HashSet<MessageId>,
    cursor: Offset,
    has_more: bool,
    in_flight: Option<FetchRequest>,
    epoch: u64,
    composer: Composer,
}

impl Default for ReconciliationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconciliationEngine {
    /// Create an idle engine.
    #[must_use]
    pub fn new() -> Self {
        Self {
            conversation: None,
            state: EngineState::Idle,
            messages: Vec::new(),
            seen: HashSet::new(),
            cursor: Offset::Latest,
            has_more: true,
            in_flight: None,
            epoch: 0,
            composer: Composer::default(),
        }
    }

    /// Make `conversation` active.
    ///
    /// Clears the message list and the composer, resets the cursor, and
    /// returns the request for the newest page. Any request still in flight
    /// for the previous conversation becomes stale.
    pub fn activate(&mut self, conversation: ConversationId) -> (FetchRequest, Outcome) {
        self.epoch += 1;
        self.messages.clear();
        self.seen.clear();
        self.cursor = Offset::Latest;
        self.has_more = true;
        self.composer.clear();
        self.state = EngineState::Loading;

        let request = FetchRequest {
            conversation: conversation.clone(),
            offset: Offset::Latest,
            epoch: self.epoch,
        };
        self.conversation = Some(conversation);
        self.in_flight = Some(request.clone());

        tracing::debug!(conversation = ?self.conversation, epoch = self.epoch, "conversation activated");
        (request, Outcome::changed(Some(ScrollIntent::Bottom)))
    }

    /// Return to idle, dropping the active conversation.
    pub fn deactivate(&mut self) {
        self.conversation = None;
        self.state = EngineState::Idle;
        self.messages.clear();
        self.seen.clear();
        self.cursor = Offset::Latest;
        self.has_more = true;
        self.in_flight = None;
        self.composer.clear();
    }

    /// Merge a history page (newest first) answering `request`.
    ///
    /// A page for anything other than the request in flight is ignored. An
    /// empty page marks the beginning of the conversation. Otherwise the
    /// page is reversed, messages already present are skipped, and the rest
    /// is prepended; the cursor moves to the oldest message of the page.
    pub fn apply_page(&mut self, request: &FetchRequest, page: Vec<Message>) -> Outcome {
        if self.in_flight.as_ref() != Some(request) {
            tracing::debug!(
                conversation = %request.conversation,
                offset = %request.offset,
                "discarding stale history page"
            );
            return Outcome::unchanged();
        }
        self.in_flight = None;
        let initial = self.state == EngineState::Loading;
        self.state = EngineState::Ready(ReadyState::Stable);

        if page.is_empty() {
            self.has_more = false;
            tracing::debug!(conversation = %request.conversation, "reached beginning of history");
            return Outcome::changed(None);
        }

        if let Some(oldest) = page.iter().rev().find_map(|m| m.id.clone()) {
            self.cursor = Offset::Before(oldest);
        }

        let mut older: Vec<Message> = Vec::with_capacity(page.len());
        for message in page.into_iter().rev() {
            match &message.id {
                Some(id) if self.seen.insert(id.clone()) => older.push(message),
                Some(_) => {}
                None => tracing::warn!("history page contained a message without id"),
            }
        }
        older.append(&mut self.messages);
        self.messages = older;

        let scroll = if initial {
            ScrollIntent::Bottom
        } else {
            match request.offset.message_id() {
                Some(anchor) => ScrollIntent::Anchor(anchor.clone()),
                None => ScrollIntent::Bottom,
            }
        };
        Outcome::changed(Some(scroll))
    }

    /// Record that the request in flight failed.
    ///
    /// The cursor is left where it was, so scrolling to the top again
    /// retries the same page.
    pub fn page_failed(&mut self, request: &FetchRequest) -> Outcome {
        if self.in_flight.as_ref() != Some(request) {
            return Outcome::unchanged();
        }
        self.in_flight = None;
        self.state = EngineState::Ready(ReadyState::Stable);
        Outcome::changed(None)
    }

    /// The oldest displayed message scrolled into view.
    ///
    /// Returns the request for the preceding page, or `None` when a request
    /// is already in flight, the beginning has been reached, or `message_id`
    /// is not the oldest message shown. The cursor only ever moves older.
    pub fn on_scroll_top(&mut self, message_id: &MessageId) -> Option<FetchRequest> {
        if self.state != EngineState::Ready(ReadyState::Stable) || !self.has_more {
            return None;
        }
        let oldest = self.messages.first().and_then(|m| m.id.as_ref());
        if oldest != Some(message_id) {
            tracing::debug!(%message_id, ?oldest, "scroll trigger is not the oldest message, ignored");
            return None;
        }
        let conversation = self.conversation.clone()?;

        self.cursor = Offset::Before(message_id.clone());
        let request = FetchRequest {
            conversation,
            offset: self.cursor.clone(),
            epoch: self.epoch,
        };
        self.state = EngineState::Ready(ReadyState::FetchingMore);
        self.in_flight = Some(request.clone());
        Some(request)
    }

    /// Append a message pushed by the server.
    pub fn apply_push(&mut self, conversation: &ConversationId, message: Message) -> Outcome {
        self.append(conversation, message, "push")
    }

    /// Append the confirmation of one of the user's own sends.
    pub fn apply_confirmed(&mut self, conversation: &ConversationId, message: Message) -> Outcome {
        self.append(conversation, message, "confirmation")
    }

    fn append(&mut self, conversation: &ConversationId, message: Message, source: &str) -> Outcome {
        if self.conversation.as_ref() != Some(conversation) {
            tracing::debug!(%conversation, source, "discarding message for inactive conversation");
            return Outcome::unchanged();
        }
        let Some(id) = message.id.clone() else {
            tracing::warn!(source, "refusing to display a message without id");
            return Outcome::unchanged();
        };
        if !self.seen.insert(id) {
            return Outcome::unchanged();
        }
        self.messages.push(message);
        Outcome::changed(Some(ScrollIntent::Bottom))
    }

    /// Active conversation.
    #[must_use]
    pub const fn conversation(&self) -> Option<&ConversationId> {
        self.conversation.as_ref()
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> EngineState {
        self.state
    }

    /// Displayed messages, oldest first.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Pagination cursor.
    #[must_use]
    pub const fn cursor(&self) -> &Offset {
        &self.cursor
    }

    /// Whether older history may exist.
    #[must_use]
    pub const fn has_more(&self) -> bool {
        self.has_more
    }

    /// Whether a history request is in flight.
    #[must_use]
    pub const fn is_loading(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Activation counter; increases on every [`activate`](Self::activate).
    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// The composer.
    #[must_use]
    pub const fn composer(&self) -> &Composer {
        &self.composer
    }

    /// Mutable access to the composer.
    pub const fn composer_mut(&mut self) -> &mut Composer {
        &mut self.composer
    }
}
