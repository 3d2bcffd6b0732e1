//! WebSocket delivery channel.
//!
//! One WebSocket connection per subscription. The conversation and resume
//! offset travel as query parameters on the upgrade request; afterwards
//! every frame is a JSON text message (see [`dmchat_proto::frame`]).
//!
//! Submissions are correlated with acknowledgments by a per-connection
//! `ack_id`. A background reader task resolves waiting submissions and
//! forwards pushes for this conversation to the [`Inbound`] stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use dmchat_proto::frame::{self, Frame};
use dmchat_proto::message::{AckPayload, ConversationId, EventName, Message, Offset};

use super::{Ack, ChannelConnector, ChannelError, DeliveryChannel, Inbound};

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    WsMessage,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Submissions waiting for their acknowledgment, keyed by `ack_id`.
type PendingAcks = parking_lot::Mutex<HashMap<u64, oneshot::Sender<AckPayload>>>;

/// Path of the WebSocket endpoint when the configured host has none.
const DEFAULT_WS_PATH: &str = "/ws";

/// Opens [`WsChannel`]s against one server.
#[derive(Debug, Clone)]
pub struct WsConnector {
    ws_host: String,
    connect_timeout: Duration,
    inbound_capacity: usize,
}

impl WsConnector {
    /// Create a connector for `ws_host` (e.g. `ws://127.0.0.1:9000`).
    pub fn new(ws_host: impl Into<String>, connect_timeout: Duration, inbound_capacity: usize) -> Self {
        Self {
            ws_host: ws_host.into(),
            connect_timeout,
            inbound_capacity,
        }
    }

    /// Build the upgrade URL for a subscription.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Io`] if the configured host is not a URL.
    pub fn endpoint(
        &self,
        conversation: &ConversationId,
        resume: &Offset,
    ) -> Result<Url, ChannelError> {
        let mut url = Url::parse(&self.ws_host).map_err(|e| {
            ChannelError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid ws host {}: {e}", self.ws_host),
            ))
        })?;
        if url.path().is_empty() || url.path() == "/" {
            url.set_path(DEFAULT_WS_PATH);
        }
        {
            let mut query = url.query_pairs_mut();
            for (key, value) in frame::connect_query(conversation, resume) {
                query.append_pair(key, &value);
            }
        }
        Ok(url)
    }
}

impl ChannelConnector for WsConnector {
    type Channel = WsChannel;

    async fn connect(
        &self,
        conversation: &ConversationId,
        resume: &Offset,
    ) -> Result<(WsChannel, Inbound), ChannelError> {
        let url = self.endpoint(conversation, resume)?;

        let (ws_stream, _response) =
            tokio::time::timeout(self.connect_timeout, connect_async(url.as_str()))
                .await
                .map_err(|_| {
                    tracing::warn!(%url, "WebSocket connect timed out");
                    ChannelError::Timeout(self.connect_timeout)
                })?
                .map_err(|e| {
                    tracing::warn!(%url, err = %e, "WebSocket connect failed");
                    map_ws_connect_error(e, &url)
                })?;

        let (ws_sender, ws_reader) = ws_stream.split();
        let (tx, rx) = mpsc::channel(self.inbound_capacity);
        let connected = Arc::new(AtomicBool::new(true));
        let pending: Arc<PendingAcks> = Arc::new(parking_lot::Mutex::new(HashMap::new()));
        let event = EventName::for_conversation(conversation);

        let reader_handle = tokio::spawn(reader_loop(
            ws_reader,
            event.clone(),
            tx,
            Arc::clone(&pending),
            Arc::clone(&connected),
        ));

        tracing::info!(%conversation, %resume, "delivery channel connected");

        let channel = WsChannel {
            conversation: conversation.clone(),
            event,
            ws_sender: Arc::new(Mutex::new(ws_sender)),
            pending,
            next_ack_id: AtomicU64::new(1),
            connected,
            reader_handle,
        };
        Ok((channel, rx))
    }
}

/// A delivery channel over one WebSocket connection.
pub struct WsChannel {
    conversation: ConversationId,
    event: EventName,
    /// Write half of the connection (shared for concurrent sends).
    ws_sender: Arc<Mutex<WsSender>>,
    pending: Arc<PendingAcks>,
    next_ack_id: AtomicU64,
    connected: Arc<AtomicBool>,
    reader_handle: tokio::task::JoinHandle<()>,
}

impl WsChannel {
    /// Number of submissions still waiting for an acknowledgment.
    #[must_use]
    pub fn pending_acks(&self) -> usize {
        self.pending.lock().len()
    }
}

impl DeliveryChannel for WsChannel {
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
        if *event != self.event {
            tracing::debug!(%event, subscribed = %self.event, "emitting on a foreign event");
        }

        let ack_id = self.next_ack_id.fetch_add(1, Ordering::Relaxed);
        let text = frame::encode(&Frame::Emit {
            event: event.clone(),
            ack_id,
            data: message.clone(),
        })?;

        let (ack_tx, ack_rx) = oneshot::channel();
        self.pending.lock().insert(ack_id, ack_tx);

        let sent = self
            .ws_sender
            .lock()
            .await
            .send(WsMessage::Text(text.into()))
            .await;
        if let Err(e) = sent {
            tracing::warn!(err = %e, "WebSocket send failed");
            self.connected.store(false, Ordering::Relaxed);
            self.pending.lock().remove(&ack_id);
            return Err(ChannelError::ConnectionClosed);
        }

        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(Ok(payload)) => Ack::try_from(payload),
            Ok(Err(_)) => Err(ChannelError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().remove(&ack_id);
                Err(ChannelError::Timeout(timeout))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn disconnect(&self) {
        let was_connected = self.connected.swap(false, Ordering::Relaxed);
        self.reader_handle.abort();
        self.pending.lock().clear();
        if !was_connected {
            return;
        }

        let sender = Arc::clone(&self.ws_sender);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let _ = sender.lock().await.close().await;
            });
        }
        tracing::info!(conversation = %self.conversation, "delivery channel disconnected");
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

/// Background task that reads frames and dispatches them.
///
/// Acknowledgments resolve their waiting submission; pushes for this
/// conversation go to `tx`. Malformed frames are logged and skipped. On
/// exit the channel is marked disconnected and every waiting submission
/// fails with [`ChannelError::ConnectionClosed`].
async fn reader_loop(
    mut ws_reader: WsReader,
    event: EventName,
    tx: mpsc::Sender<Message>,
    pending: Arc<PendingAcks>,
    connected: Arc<AtomicBool>,
) {
    while let Some(msg_result) = ws_reader.next().await {
        match msg_result {
            Ok(WsMessage::Text(text)) => match frame::decode(&text) {
                Ok(Frame::Ack { ack_id, data }) => {
                    let waiter = pending.lock().remove(&ack_id);
                    match waiter {
                        Some(waiter) => {
                            let _ = waiter.send(data);
                        }
                        None => tracing::debug!(ack_id, "acknowledgment arrived after timeout"),
                    }
                }
                Ok(Frame::Push { event: pushed, data }) => {
                    if pushed != event {
                        tracing::debug!(%pushed, "push for another conversation, skipping");
                        continue;
                    }
                    if tx.send(data).await.is_err() {
                        // Inbound receiver dropped, nobody is listening.
                        break;
                    }
                }
                Ok(Frame::Emit { .. }) => {
                    tracing::debug!("server sent an emit frame, ignoring");
                }
                Err(e) => {
                    tracing::warn!(err = %e, "malformed frame, skipping");
                }
            },
            Ok(WsMessage::Close(_)) => {
                tracing::info!("WebSocket closed by server");
                break;
            }
            Ok(WsMessage::Binary(_) | WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_)) => {}
            Err(e) => {
                tracing::warn!(err = %e, "WebSocket read error");
                break;
            }
        }
    }
    connected.store(false, Ordering::Relaxed);
    pending.lock().clear();
    tracing::info!("delivery channel reader exiting");
}

/// Map a `tokio_tungstenite` connection error to a [`ChannelError`].
fn map_ws_connect_error(err: tokio_tungstenite::tungstenite::Error, url: &Url) -> ChannelError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            if io_err.kind() == std::io::ErrorKind::ConnectionRefused
                || io_err.kind() == std::io::ErrorKind::AddrNotAvailable
            {
                ChannelError::Unreachable {
                    url: url.to_string(),
                }
            } else {
                ChannelError::Io(io_err)
            }
        }
        WsError::Http(response) => ChannelError::Io(std::io::Error::other(format!(
            "WebSocket upgrade rejected: status {}",
            response.status()
        ))),
        other => ChannelError::Io(std::io::Error::other(format!(
            "WebSocket connection error: {other}"
        ))),
    }
}
