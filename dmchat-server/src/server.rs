//! Server core: shared state, WebSocket delivery handler, and HTTP API.
//!
//! Each WebSocket subscribes to one conversation, chosen by the connect
//! query. Submitted messages are validated, persisted, acknowledged to the
//! submitter, and pushed to every other subscriber of the conversation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use axum::Json;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{RwLock, mpsc};

use dmchat_proto::api::{
    ApiResponse, HISTORY_PATH, INFO_PATH, Identity, LIST_PATH, USER_COOKIE, USER_HEADER,
    WHOAMI_PATH,
};
use dmchat_proto::frame::{self, Frame};
use dmchat_proto::message::{AckPayload, ConversationId, EventName, Message, Offset};

use crate::store::ConversationStore;

type Subscribers = HashMap<u64, mpsc::UnboundedSender<WsMessage>>;

/// Shared server state holding the store and the subscriber registry.
pub struct ServerState {
    /// Persisted conversations.
    pub store: ConversationStore,
    subscribers: RwLock<HashMap<ConversationId, Subscribers>>,
    next_connection: AtomicU64,
    dropped_acks: AtomicUsize,
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new(ConversationStore::new())
    }
}

impl ServerState {
    /// Creates server state around `store`.
    #[must_use]
    pub fn new(store: ConversationStore) -> Self {
        Self {
            store,
            subscribers: RwLock::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
            dropped_acks: AtomicUsize::new(0),
        }
    }

    /// Persist the next `count` submissions without acknowledging them.
    ///
    /// Lets tests exercise client retries against a real socket.
    pub fn drop_next_acks(&self, count: usize) {
        self.dropped_acks.store(count, Ordering::SeqCst);
    }

    /// Number of live subscribers of `conversation`.
    pub async fn subscriber_count(&self, conversation: &ConversationId) -> usize {
        self.subscribers
            .read()
            .await
            .get(conversation)
            .map_or(0, HashMap::len)
    }

    /// Persist a message from `sender` and push it to every subscriber.
    ///
    /// Stands in for a participant using another client.
    pub async fn post(&self, conversation: &ConversationId, sender: &str, content: &str) -> Message {
        let appended = self
            .store
            .append(conversation, Message::speculative(content, sender))
            .await;
        self.push(conversation, None, &appended.message).await;
        appended.message
    }

    /// Send a Close frame to every subscriber.
    pub async fn close_all_connections(&self) {
        let subscribers = self.subscribers.read().await;
        for (conversation, sockets) in subscribers.iter() {
            tracing::info!(%conversation, count = sockets.len(), "closing subscribers");
            for sender in sockets.values() {
                let _ = sender.send(WsMessage::Close(None));
            }
        }
    }

    async fn subscribe(
        &self,
        conversation: &ConversationId,
        sender: mpsc::UnboundedSender<WsMessage>,
    ) -> u64 {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .await
            .entry(conversation.clone())
            .or_default()
            .insert(id, sender);
        id
    }

    async fn unsubscribe(&self, conversation: &ConversationId, connection: u64) {
        let mut subscribers = self.subscribers.write().await;
        if let Some(sockets) = subscribers.get_mut(conversation) {
            sockets.remove(&connection);
            if sockets.is_empty() {
                subscribers.remove(conversation);
            }
        }
    }

    /// Push `message` to the subscribers of `conversation`, skipping
    /// `except`.
    async fn push(&self, conversation: &ConversationId, except: Option<u64>, message: &Message) {
        let frame = Frame::Push {
            event: EventName::for_conversation(conversation),
            data: message.clone(),
        };
        let text = match frame::encode(&frame) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode push frame");
                return;
            }
        };
        let subscribers = self.subscribers.read().await;
        let Some(sockets) = subscribers.get(conversation) else {
            return;
        };
        for (id, sender) in sockets {
            if Some(*id) == except {
                continue;
            }
            if sender.send(WsMessage::Text(text.clone().into())).is_err() {
                tracing::debug!(connection = id, "subscriber gone, push skipped");
            }
        }
    }

    /// Consume one dropped-ack credit, if any remain.
    fn take_dropped_ack(&self) -> bool {
        self.dropped_acks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Query string of the WebSocket endpoint.
#[derive(Debug, Deserialize)]
struct ConnectQuery {
    #[serde(rename = "privateMsgId")]
    conversation: ConversationId,
    #[serde(rename = "privateMsgOffset", default)]
    offset: Option<String>,
}

/// Query string of the history endpoint.
#[derive(Debug, Deserialize)]
struct HistoryQuery {
    #[serde(default)]
    offset: Option<String>,
}

fn parse_offset(raw: Option<&str>) -> Offset {
    raw.map_or(Offset::Latest, |s| s.parse().unwrap_or_default())
}

/// axum handler that upgrades an HTTP request to a subscription.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectQuery>,
    State(state): State<Arc<ServerState>>,
) -> impl IntoResponse {
    let resume = parse_offset(query.offset.as_deref());
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.conversation, resume))
}

/// Handles one subscription for its whole lifetime.
///
/// 1. Register the socket under its conversation.
/// 2. Replay what the subscriber missed since `resume`.
/// 3. Process submissions until the socket closes.
/// 4. Unregister.
pub async fn handle_socket(
    socket: WebSocket,
    state: Arc<ServerState>,
    conversation: ConversationId,
    resume: Offset,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let connection = state.subscribe(&conversation, tx.clone()).await;
    tracing::info!(%conversation, connection, %resume, "subscriber connected");

    let event = EventName::for_conversation(&conversation);
    for message in state.store.missed_since(&conversation, &resume).await {
        let push = Frame::Push {
            event: event.clone(),
            data: message,
        };
        if let Ok(text) = frame::encode(&push) {
            let _ = tx.send(WsMessage::Text(text.into()));
        }
    }

    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, WsMessage::Close(_));
            if ws_sender.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    let reader_state = Arc::clone(&state);
    let reader_conversation = conversation.clone();
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                WsMessage::Text(text) => {
                    handle_text(
                        &reader_state,
                        &reader_conversation,
                        connection,
                        &tx,
                        text.as_str(),
                    )
                    .await;
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => write_task.abort(),
        _ = &mut write_task => read_task.abort(),
    }

    state.unsubscribe(&conversation, connection).await;
    tracing::info!(%conversation, connection, "subscriber disconnected");
}

async fn handle_text(
    state: &ServerState,
    conversation: &ConversationId,
    connection: u64,
    reply: &mpsc::UnboundedSender<WsMessage>,
    text: &str,
) {
    let (event, ack_id, data) = match frame::decode(text) {
        Ok(Frame::Emit {
            event,
            ack_id,
            data,
        }) => (event, ack_id, data),
        Ok(other) => {
            tracing::warn!(connection, frame = ?other, "unexpected frame from client");
            return;
        }
        Err(e) => {
            tracing::warn!(connection, error = %e, "malformed frame");
            return;
        }
    };

    let ack = match accept(state, conversation, connection, &event, data).await {
        Ok(ack) => ack,
        Err(reason) => {
            tracing::warn!(%conversation, connection, %reason, "submission rejected");
            Some(AckPayload::rejected(reason))
        }
    };
    let Some(ack) = ack else {
        return;
    };
    match frame::encode(&Frame::Ack { ack_id, data: ack }) {
        Ok(text) => {
            let _ = reply.send(WsMessage::Text(text.into()));
        }
        Err(e) => tracing::error!(error = %e, "failed to encode ack frame"),
    }
}

/// Validate and persist one submission.
///
/// Returns the acknowledgment to send, or `None` when it is dropped on
/// purpose.
async fn accept(
    state: &ServerState,
    conversation: &ConversationId,
    connection: u64,
    event: &EventName,
    message: Message,
) -> Result<Option<AckPayload>, String> {
    if event.conversation().as_ref() != Some(conversation) {
        return Err(format!("event {event} does not belong to this subscription"));
    }
    message.validate().map_err(|e| e.to_string())?;

    let appended = state.store.append(conversation, message).await;
    let Some(id) = appended.message.id.clone() else {
        return Err("message was not assigned an id".to_string());
    };
    tracing::debug!(%conversation, %id, duplicate = appended.duplicate, "message persisted");

    if !appended.duplicate {
        state.push(conversation, Some(connection), &appended.message).await;
    }
    if state.take_dropped_ack() {
        tracing::debug!(%id, "dropping acknowledgment");
        return Ok(None);
    }
    Ok(Some(AckPayload::sent(id)))
}

// ---------------------------------------------------------------------------
// HTTP API
// ---------------------------------------------------------------------------

/// Error body for rejected API requests.
#[derive(Debug)]
enum ApiRejection {
    NotLoggedIn,
}

impl IntoResponse for ApiRejection {
    fn into_response(self) -> Response {
        match self {
            Self::NotLoggedIn => (StatusCode::FORBIDDEN, "not logged in").into_response(),
        }
    }
}

/// Username from the user header, falling back to the user cookie.
fn caller(headers: &HeaderMap) -> Result<String, ApiRejection> {
    if let Some(user) = headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        return Ok(user.to_string());
    }
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == USER_COOKIE && !value.is_empty())
        .map(|(_, value)| value.to_string())
        .ok_or(ApiRejection::NotLoggedIn)
}

/// Four-digit discriminator derived from the username.
fn tag_for(username: &str) -> String {
    let hash = username
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)));
    format!("{:04}", hash % 10_000)
}

async fn history_handler(
    Path(conversation): Path<ConversationId>,
    Query(query): Query<HistoryQuery>,
    headers: HeaderMap,
    State(state): State<Arc<ServerState>>,
) -> Result<Json<ApiResponse<Vec<Message>>>, ApiRejection> {
    caller(&headers)?;
    let offset = parse_offset(query.offset.as_deref());
    let page = state.store.page(&conversation, &offset).await;
    tracing::debug!(%conversation, %offset, len = page.len(), "history page served");
    Ok(Json(ApiResponse::new(page)))
}

async fn info_handler(
    Path(conversation): Path<ConversationId>,
    headers: HeaderMap,
    State(state): State<Arc<ServerState>>,
) -> Result<impl IntoResponse, ApiRejection> {
    caller(&headers)?;
    Ok(Json(ApiResponse::new(state.store.info(&conversation).await)))
}

async fn list_handler(
    headers: HeaderMap,
    State(state): State<Arc<ServerState>>,
) -> Result<impl IntoResponse, ApiRejection> {
    caller(&headers)?;
    Ok(Json(ApiResponse::new(state.store.list().await)))
}

async fn whoami_handler(headers: HeaderMap) -> Result<Json<ApiResponse<Identity>>, ApiRejection> {
    let username = caller(&headers)?;
    let tag = tag_for(&username);
    Ok(Json(ApiResponse::new(Identity { username, tag })))
}

/// Builds the router with every route.
pub fn router(state: Arc<ServerState>) -> axum::Router {
    axum::Router::new()
        .route("/ws", get(ws_handler))
        .route(&format!("{HISTORY_PATH}/{{id}}"), get(history_handler))
        .route(&format!("{INFO_PATH}/{{id}}"), get(info_handler))
        .route(LIST_PATH, get(list_handler))
        .route(WHOAMI_PATH, get(whoami_handler))
        .with_state(state)
}

/// Starts the server on the given address and returns the bound address
/// and a join handle.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(ServerState::default())).await
}

/// Starts the server with a pre-configured [`ServerState`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<ServerState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "server error");
        }
    });
    Ok((bound_addr, handle))
}
