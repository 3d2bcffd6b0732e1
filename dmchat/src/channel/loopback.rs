//! Loopback delivery channel for testing.
//!
//! [`LoopbackServer`] is an in-process stand-in for the message server: it
//! assigns ids, fans pushes out to other subscribers, serves history pages,
//! and answers submissions according to a script of [`AckBehavior`]s. Every
//! submission attempt is recorded so tests can count retries.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use dmchat_proto::api::{ConversationInfo, ConversationSummary, Identity, select_page};
use dmchat_proto::message::{AckPayload, ConversationId, EventName, Message, MessageId, Offset};

use super::{Ack, ChannelConnector, ChannelError, DeliveryChannel, Inbound};
use crate::api::{ApiError, ConversationDirectory, IdentityApi};
use crate::history::{DEFAULT_PAGE_SIZE, HistoryFetcher};

/// Username reported by the loopback identity lookup.
pub const LOOPBACK_USER: &str = "loopback";

/// How the loopback server answers one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckBehavior {
    /// Persist and acknowledge with the assigned id.
    Confirm,
    /// Lose the submission; the sender times out.
    Timeout,
    /// Persist the message but lose the acknowledgment.
    LoseAck,
    /// Acknowledge without an id.
    NoId,
    /// Refuse with a reason.
    Reject(String),
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Message>,
    connected: Arc<AtomicBool>,
}

#[derive(Default)]
struct ServerState {
    conversations: HashMap<ConversationId, Vec<Message>>,
    nonces: HashMap<Uuid, MessageId>,
    next_message_id: u64,
    subscribers: HashMap<ConversationId, Vec<Subscriber>>,
    next_subscriber_id: u64,
    script: VecDeque<AckBehavior>,
    attempts: Vec<Message>,
    connections: Vec<(ConversationId, Offset)>,
    refuse_connections: bool,
    logged_out: bool,
}

impl ServerState {
    /// Store a message, returning its id and whether it was new.
    fn persist(&mut self, conversation: &ConversationId, message: &Message) -> (MessageId, bool) {
        if let Some(nonce) = message.ext.client_nonce {
            if let Some(id) = self.nonces.get(&nonce) {
                return (id.clone(), false);
            }
        }
        self.next_message_id += 1;
        let id = MessageId::new(self.next_message_id.to_string());
        if let Some(nonce) = message.ext.client_nonce {
            self.nonces.insert(nonce, id.clone());
        }
        let mut stored = message.clone();
        stored.id = Some(id.clone());
        self.conversations
            .entry(conversation.clone())
            .or_default()
            .push(stored);
        (id, true)
    }

    /// Push a stored message to every subscriber except `exclude`.
    fn fan_out(&mut self, conversation: &ConversationId, message: &Message, exclude: Option<u64>) {
        let Some(subscribers) = self.subscribers.get_mut(conversation) else {
            return;
        };
        subscribers.retain(|sub| !sub.tx.is_closed());
        for sub in subscribers.iter().filter(|sub| Some(sub.id) != exclude) {
            if sub.tx.try_send(message.clone()).is_err() {
                tracing::warn!(%conversation, subscriber = sub.id, "loopback push dropped");
            }
        }
    }

    fn last_message(&self, conversation: &ConversationId) -> Option<Message> {
        self.conversations
            .get(conversation)
            .and_then(|messages| messages.last())
            .cloned()
    }
}

/// In-process message server shared by loopback channels.
#[derive(Clone)]
pub struct LoopbackServer {
    state: Arc<Mutex<ServerState>>,
    page_size: usize,
}

impl LoopbackServer {
    /// Create a server that serves history pages of `page_size` messages.
    #[must_use]
    pub fn new(page_size: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState::default())),
            page_size,
        }
    }

    /// A connector that subscribes to this server.
    #[must_use]
    pub fn connector(&self, inbound_capacity: usize) -> LoopbackConnector {
        LoopbackConnector {
            server: self.clone(),
            inbound_capacity,
        }
    }

    /// Queue answers for the next submissions; once the script runs out,
    /// submissions are confirmed.
    pub fn script_acks(&self, behaviors: impl IntoIterator<Item = AckBehavior>) {
        self.state.lock().script.extend(behaviors);
    }

    /// Seed a conversation with `count` messages.
    pub fn seed(&self, conversation: &ConversationId, count: usize, sender: &str) {
        let mut state = self.state.lock();
        for i in 1..=count {
            state.persist(
                conversation,
                &Message::speculative(format!("message {i}"), sender),
            );
        }
    }

    /// Another participant posts a message; it is stored and pushed to
    /// every subscriber of the conversation.
    pub fn post(&self, conversation: &ConversationId, sender: &str, content: &str) -> Message {
        let mut state = self.state.lock();
        state.persist(conversation, &Message::speculative(content, sender));
        let stored = state
            .last_message(conversation)
            .unwrap_or_else(|| Message::speculative(content, sender));
        state.fan_out(conversation, &stored, None);
        stored
    }

    /// Stored messages of a conversation, oldest first.
    #[must_use]
    pub fn messages(&self, conversation: &ConversationId) -> Vec<Message> {
        self.state
            .lock()
            .conversations
            .get(conversation)
            .cloned()
            .unwrap_or_default()
    }

    /// Every submission attempt received, in arrival order.
    #[must_use]
    pub fn attempts(&self) -> Vec<Message> {
        self.state.lock().attempts.clone()
    }

    /// Every subscription request: conversation and resume offset.
    #[must_use]
    pub fn connections(&self) -> Vec<(ConversationId, Offset)> {
        self.state.lock().connections.clone()
    }

    /// Number of live subscriptions to a conversation.
    #[must_use]
    pub fn subscriber_count(&self, conversation: &ConversationId) -> usize {
        self.state
            .lock()
            .subscribers
            .get(conversation)
            .map_or(0, |subs| subs.iter().filter(|s| !s.tx.is_closed()).count())
    }

    /// Answer later API lookups as if the session cookie expired.
    pub fn log_out(&self) {
        self.state.lock().logged_out = true;
    }

    /// Make later connection attempts fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse_connections = refuse;
    }

    /// Drop every subscription to a conversation from the server side.
    pub fn kick(&self, conversation: &ConversationId) {
        if let Some(subs) = self.state.lock().subscribers.remove(conversation) {
            for sub in subs {
                sub.connected.store(false, Ordering::Relaxed);
            }
        }
    }

    fn unsubscribe(&self, conversation: &ConversationId, subscriber: u64) {
        if let Some(subs) = self.state.lock().subscribers.get_mut(conversation) {
            subs.retain(|sub| sub.id != subscriber);
        }
    }
}

impl Default for LoopbackServer {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE)
    }
}

impl HistoryFetcher for LoopbackServer {
    async fn fetch_page(
        &self,
        conversation: &ConversationId,
        offset: &Offset,
    ) -> Result<Vec<Message>, ApiError> {
        let state = self.state.lock();
        Ok(state
            .conversations
            .get(conversation)
            .map(|messages| select_page(messages, offset, self.page_size))
            .unwrap_or_default())
    }
}

impl IdentityApi for LoopbackServer {
    async fn whoami(&self) -> Result<Identity, ApiError> {
        if self.state.lock().logged_out {
            return Err(ApiError::Unauthorized);
        }
        Ok(Identity {
            username: LOOPBACK_USER.to_string(),
            tag: "0001".to_string(),
        })
    }
}

impl ConversationDirectory for LoopbackServer {
    async fn conversation_info(
        &self,
        conversation: &ConversationId,
    ) -> Result<ConversationInfo, ApiError> {
        if self.state.lock().logged_out {
            return Err(ApiError::Unauthorized);
        }
        Ok(ConversationInfo {
            msg_title: format!("Conversation {conversation}"),
        })
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, ApiError> {
        let state = self.state.lock();
        if state.logged_out {
            return Err(ApiError::Unauthorized);
        }
        let mut list: Vec<ConversationSummary> = state
            .conversations
            .keys()
            .map(|id| ConversationSummary {
                id: id.clone(),
                msg_title: format!("Conversation {id}"),
            })
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(list)
    }
}

/// Opens [`LoopbackChannel`]s on a [`LoopbackServer`].
#[derive(Clone)]
pub struct LoopbackConnector {
    server: LoopbackServer,
    inbound_capacity: usize,
}

impl ChannelConnector for LoopbackConnector {
    type Channel = LoopbackChannel;

    async fn connect(
        &self,
        conversation: &ConversationId,
        resume: &Offset,
    ) -> Result<(LoopbackChannel, Inbound), ChannelError> {
        let mut state = self.server.state.lock();
        state
            .connections
            .push((conversation.clone(), resume.clone()));
        if state.refuse_connections {
            return Err(ChannelError::Unreachable {
                url: "loopback".into(),
            });
        }

        let (tx, rx) = mpsc::channel(self.inbound_capacity);
        let connected = Arc::new(AtomicBool::new(true));
        state.next_subscriber_id += 1;
        let subscriber_id = state.next_subscriber_id;
        state
            .subscribers
            .entry(conversation.clone())
            .or_default()
            .push(Subscriber {
                id: subscriber_id,
                tx,
                connected: Arc::clone(&connected),
            });

        let channel = LoopbackChannel {
            conversation: conversation.clone(),
            server: self.server.clone(),
            subscriber_id,
            connected,
        };
        Ok((channel, rx))
    }
}

/// A subscription to a [`LoopbackServer`] conversation.
pub struct LoopbackChannel {
    conversation: ConversationId,
    server: LoopbackServer,
    subscriber_id: u64,
    connected: Arc<AtomicBool>,
}

impl DeliveryChannel for LoopbackChannel {
    fn conversation(&self) -> &ConversationId {
        &self.conversation
    }

    async fn send(
        &self,
        event: &EventName,
        message: &Message,
        timeout: Duration,
    ) -> Result<Ack, ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::ConnectionClosed);
        }

        // `None` means the acknowledgment never arrives.
        let reply = {
            let mut state = self.server.state.lock();
            state.attempts.push(message.clone());
            let behavior = state.script.pop_front().unwrap_or(AckBehavior::Confirm);
            let acknowledge = behavior == AckBehavior::Confirm;

            if event.conversation().as_ref() == Some(&self.conversation) {
                match behavior {
                    AckBehavior::Confirm | AckBehavior::LoseAck => {
                        let (id, fresh) = state.persist(&self.conversation, message);
                        if fresh {
                            if let Some(stored) = state.last_message(&self.conversation) {
                                state.fan_out(
                                    &self.conversation,
                                    &stored,
                                    Some(self.subscriber_id),
                                );
                            }
                        }
                        acknowledge.then(|| AckPayload::sent(id))
                    }
                    AckBehavior::Timeout => None,
                    AckBehavior::NoId => Some(AckPayload::default()),
                    AckBehavior::Reject(reason) => Some(AckPayload::rejected(reason)),
                }
            } else {
                Some(AckPayload::rejected(format!("not subscribed to {event}")))
            }
        };

        match reply {
            Some(payload) => Ack::try_from(payload),
            None => {
                tokio::time::sleep(timeout).await;
                Err(ChannelError::Timeout(timeout))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.server
            .unsubscribe(&self.conversation, self.subscriber_id);
    }
}

impl Drop for LoopbackChannel {
    fn drop(&mut self) {
        self.disconnect();
    }
}
