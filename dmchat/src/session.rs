//! Session coordinator.
//!
//! Owns the [`ReconciliationEngine`] and drives it from one tokio task.
//! The presentation layer sends [`SessionCommand`]s through a
//! [`SessionHandle`] and consumes [`SessionEvent`]s. History fetches,
//! channel connects, sends, and API lookups run as spawned tasks that
//! report back on an internal channel; the engine decides whether each
//! result is still relevant.
//!
//! ```text
//! presentation  ─── SessionCommand ──▶  session task  ◀── task results ── spawned I/O
//!               ◀── SessionEvent ─────               ◀── pushes ───────── delivery channel
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use dmchat_proto::api::{ConversationInfo, ConversationSummary, Identity};
use dmchat_proto::message::{ConversationId, Message, MessageId, Offset, ValidationError};

use crate::api::{ApiError, ConversationDirectory, IdentityApi};
use crate::channel::{ChannelConnector, ChannelError, DeliveryChannel, Inbound};
use crate::engine::{FetchRequest, Outcome, ReconciliationEngine, ScrollIntent};
use crate::history::HistoryFetcher;
use crate::log::{LogWarning, MessageLog, ResilientLogWriter};
use crate::pipeline::{DEFAULT_SENDER, RetryConfig, SendOutcome, SendPipeline};

/// Default capacity of the command and event channels.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Default capacity of the log warning channel.
const LOG_WARNING_BUFFER: usize = 16;

/// Default interval between retries of failed log appends.
const DEFAULT_LOG_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Commands sent from the presentation layer to the session task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// Make a conversation active.
    Open(ConversationId),
    /// Replace the composer text.
    Input(String),
    /// Submit the composer text.
    Submit,
    /// The oldest displayed message scrolled into view.
    ScrollTop(MessageId),
    /// Re-subscribe the active conversation after a disconnect.
    Reconnect,
    /// Fetch the conversation list.
    ListConversations,
    /// Stop the session.
    Shutdown,
}

/// Events sent from the session task to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The displayed message list, oldest first.
    Messages(Vec<Message>),
    /// Scroll request accompanying a list change.
    Scroll(ScrollIntent),
    /// Whether a history request is in flight.
    Loading(bool),
    /// The composer was emptied.
    ComposerCleared,
    /// Submitted text failed validation and was not sent.
    InputRejected(ValidationError),
    /// Title of the active conversation.
    Title(String),
    /// The logged-in user.
    Identity(Identity),
    /// The server does not recognize the user; show the login page.
    RedirectToLogin,
    /// Delivery channel state for a conversation.
    ConnectionStatus {
        /// Conversation the channel belongs to.
        conversation: ConversationId,
        /// Whether the channel is up.
        connected: bool,
    },
    /// A message could not be delivered and was dropped.
    SendAbandoned {
        /// Conversation the message was sent to.
        conversation: ConversationId,
        /// Text of the dropped message.
        content: String,
        /// Attempts made.
        attempts: u32,
        /// Why the last attempt failed.
        reason: String,
    },
    /// The conversation list.
    Conversations(Vec<ConversationSummary>),
    /// Non-fatal problem worth showing to the user.
    Warning(String),
}

/// Error returned when the session task is no longer running.
#[derive(Debug, thiserror::Error)]
#[error("session has shut down")]
pub struct SessionClosed;

/// Settings for a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Acknowledgment timeout and retry budget for sends.
    pub retry: RetryConfig,
    /// Capacity of the command and event channels.
    pub channel_capacity: usize,
    /// How often failed log appends are retried.
    pub log_retry_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            log_retry_interval: DEFAULT_LOG_RETRY_INTERVAL,
        }
    }
}

/// Cloneable sender of [`SessionCommand`]s.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    /// Send a raw command.
    ///
    /// # Errors
    ///
    /// Returns [`SessionClosed`] if the session task has exited.
    pub async fn send(&self, command: SessionCommand) -> Result<(), SessionClosed> {
        self.commands.send(command).await.map_err(|_| SessionClosed)
    }

    /// Make `conversation` active.
    ///
    /// # Errors
    ///
    /// Returns [`SessionClosed`] if the session task has exited.
    pub async fn open(&self, conversation: ConversationId) -> Result<(), SessionClosed> {
        self.send(SessionCommand::Open(conversation)).await
    }

    /// Put `text` in the composer and submit it.
    ///
    /// # Errors
    ///
    /// Returns [`SessionClosed`] if the session task has exited.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), SessionClosed> {
        self.send(SessionCommand::Input(text.into())).await?;
        self.send(SessionCommand::Submit).await
    }

    /// Report that the oldest displayed message scrolled into view.
    ///
    /// # Errors
    ///
    /// Returns [`SessionClosed`] if the session task has exited.
    pub async fn scroll_top(&self, message_id: MessageId) -> Result<(), SessionClosed> {
        self.send(SessionCommand::ScrollTop(message_id)).await
    }

    /// Stop the session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionClosed`] if the session task has already exited.
    pub async fn shutdown(&self) -> Result<(), SessionClosed> {
        self.send(SessionCommand::Shutdown).await
    }
}

/// Results reported by spawned tasks.
enum TaskResult<Ch> {
    Identity(Result<Identity, ApiError>),
    Title {
        conversation: ConversationId,
        result: Result<ConversationInfo, ApiError>,
    },
    Conversations(Result<Vec<ConversationSummary>, ApiError>),
    Page {
        request: FetchRequest,
        result: Result<Vec<Message>, ApiError>,
    },
    Connected {
        conversation: ConversationId,
        epoch: u64,
        result: Result<(Arc<Ch>, Inbound), ChannelError>,
    },
    Sent {
        conversation: ConversationId,
        outcome: SendOutcome,
    },
}

/// One wake-up of the session loop.
enum Step<Ch> {
    Command(Option<SessionCommand>),
    Task(TaskResult<Ch>),
    Inbound(Option<Message>),
    LogWarning(LogWarning),
}

/// The channel subscribed to the active conversation.
struct ActiveChannel<Ch> {
    conversation: ConversationId,
    channel: Arc<Ch>,
    inbound: Inbound,
}

/// Spawn the session task.
///
/// Must be called from within a tokio runtime. The identity lookup starts
/// immediately; nothing else happens until a conversation is opened.
pub fn spawn_session<C, H, L, A>(
    connector: C,
    history: H,
    log: L,
    api: A,
    config: SessionConfig,
) -> (
    SessionHandle,
    mpsc::Receiver<SessionEvent>,
    tokio::task::JoinHandle<()>,
)
where
    C: ChannelConnector + 'static,
    H: HistoryFetcher + 'static,
    L: MessageLog + 'static,
    A: IdentityApi + ConversationDirectory + 'static,
{
    let (cmd_tx, cmd_rx) = mpsc::channel(config.channel_capacity);
    let (evt_tx, evt_rx) = mpsc::channel(config.channel_capacity);
    let (results_tx, results_rx) = mpsc::unbounded_channel();
    let (writer, warnings) = ResilientLogWriter::new(log, LOG_WARNING_BUFFER);
    let log = Arc::new(writer);
    let log_retry = log.spawn_retry_task(config.log_retry_interval);

    let session = Session {
        connector: Arc::new(connector),
        history: Arc::new(history),
        log,
        api: Arc::new(api),
        pipeline: Arc::new(SendPipeline::new(config.retry)),
        engine: ReconciliationEngine::new(),
        active: None,
        sender_name: DEFAULT_SENDER.to_string(),
        events: evt_tx,
        results: results_tx,
    };

    let handle = tokio::spawn(async move {
        session.run(cmd_rx, results_rx, warnings).await;
        log_retry.abort();
    });

    (SessionHandle { commands: cmd_tx }, evt_rx, handle)
}

struct Session<C: ChannelConnector, H, L: MessageLog, A> {
    connector: Arc<C>,
    history: Arc<H>,
    log: Arc<ResilientLogWriter<L>>,
    api: Arc<A>,
    pipeline: Arc<SendPipeline>,
    engine: ReconciliationEngine,
    active: Option<ActiveChannel<C::Channel>>,
    sender_name: String,
    events: mpsc::Sender<SessionEvent>,
    results: mpsc::UnboundedSender<TaskResult<C::Channel>>,
}

impl<C, H, L, A> Session<C, H, L, A>
where
    C: ChannelConnector + 'static,
    H: HistoryFetcher + 'static,
    L: MessageLog + 'static,
    A: IdentityApi + ConversationDirectory + 'static,
{
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut results: mpsc::UnboundedReceiver<TaskResult<C::Channel>>,
        mut warnings: mpsc::Receiver<LogWarning>,
    ) {
        self.spawn_identity_lookup();

        loop {
            let step = tokio::select! {
                command = commands.recv() => Step::Command(command),
                Some(result) = results.recv() => Step::Task(result),
                pushed = next_inbound(&mut self.active) => Step::Inbound(pushed),
                Some(warning) = warnings.recv() => Step::LogWarning(warning),
            };

            match step {
                Step::Command(None | Some(SessionCommand::Shutdown)) => break,
                Step::Command(Some(command)) => self.handle_command(command).await,
                Step::Task(result) => self.handle_result(result).await,
                Step::Inbound(Some(message)) => self.handle_push(message).await,
                Step::Inbound(None) => self.handle_channel_closed().await,
                Step::LogWarning(warning) => {
                    self.emit(SessionEvent::Warning(warning.to_string())).await;
                }
            }
        }

        tracing::info!("session shutting down");
        self.teardown_channel();
        self.engine.deactivate();
        self.log.flush_pending().await;
    }

    async fn emit(&self, event: SessionEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("session event receiver dropped");
        }
    }

    /// Forward an engine outcome to the presentation layer.
    async fn publish(&self, outcome: Outcome) {
        if outcome.changed {
            self.emit(SessionEvent::Messages(self.engine.messages().to_vec()))
                .await;
        }
        if let Some(scroll) = outcome.scroll {
            self.emit(SessionEvent::Scroll(scroll)).await;
        }
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Open(conversation) => self.open(conversation).await,
            SessionCommand::Input(text) => self.engine.composer_mut().set(text),
            SessionCommand::Submit => self.submit().await,
            SessionCommand::ScrollTop(message_id) => {
                if let Some(request) = self.engine.on_scroll_top(&message_id) {
                    tracing::debug!(offset = %request.offset, "loading older messages");
                    self.emit(SessionEvent::Loading(true)).await;
                    self.spawn_fetch(request);
                }
            }
            SessionCommand::Reconnect => {
                if let Some(conversation) = self.engine.conversation().cloned() {
                    self.teardown_channel();
                    self.spawn_connect(conversation);
                }
            }
            SessionCommand::ListConversations => self.spawn_list(),
            SessionCommand::Shutdown => {}
        }
    }

    /// Switch to `conversation`: the old subscription is torn down before
    /// the new one is requested.
    async fn open(&mut self, conversation: ConversationId) {
        if self.engine.conversation() == Some(&conversation) {
            tracing::debug!(%conversation, "conversation already active");
            return;
        }
        self.teardown_channel();

        let (request, outcome) = self.engine.activate(conversation.clone());
        tracing::info!(%conversation, "opening conversation");

        self.emit(SessionEvent::ComposerCleared).await;
        self.publish(outcome).await;
        self.emit(SessionEvent::Loading(true)).await;

        self.spawn_fetch(request);
        self.spawn_title(conversation.clone());
        self.spawn_connect(conversation);
    }

    async fn submit(&mut self) {
        let raw = self.engine.composer_mut().take();
        self.emit(SessionEvent::ComposerCleared).await;

        let Some(conversation) = self.engine.conversation().cloned() else {
            tracing::debug!("submit without an active conversation");
            return;
        };

        let envelope = match self.pipeline.prepare(&raw, &self.sender_name) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.emit(SessionEvent::InputRejected(e)).await;
                return;
            }
        };

        let Some(active) = &self.active else {
            tracing::warn!(%conversation, "not connected, message dropped");
            self.emit(SessionEvent::SendAbandoned {
                conversation,
                content: raw,
                attempts: 0,
                reason: ChannelError::ConnectionClosed.to_string(),
            })
            .await;
            return;
        };

        let channel = Arc::clone(&active.channel);
        let pipeline = Arc::clone(&self.pipeline);
        let results = self.results.clone();
        tokio::spawn(async move {
            let outcome = pipeline.deliver(channel.as_ref(), envelope).await;
            let _ = results.send(TaskResult::Sent {
                conversation,
                outcome,
            });
        });
    }

    async fn handle_push(&mut self, message: Message) {
        let Some(conversation) = self.active.as_ref().map(|a| a.conversation.clone()) else {
            return;
        };
        let outcome = self.engine.apply_push(&conversation, message.clone());
        if outcome.changed {
            self.log.append(&conversation, &message).await;
        }
        self.publish(outcome).await;
    }

    async fn handle_channel_closed(&mut self) {
        if let Some(active) = self.active.take() {
            tracing::warn!(conversation = %active.conversation, "delivery channel closed");
            self.emit(SessionEvent::ConnectionStatus {
                conversation: active.conversation,
                connected: false,
            })
            .await;
        }
    }

    async fn handle_result(&mut self, result: TaskResult<C::Channel>) {
        match result {
            TaskResult::Identity(Ok(identity)) => {
                tracing::info!(user = %identity, "identified");
                self.sender_name.clone_from(&identity.username);
                self.emit(SessionEvent::Identity(identity)).await;
            }
            TaskResult::Identity(Err(e)) => self.api_failed("whoami", &e).await,
            TaskResult::Title {
                conversation,
                result,
            } => {
                if self.engine.conversation() != Some(&conversation) {
                    return;
                }
                match result {
                    Ok(info) => self.emit(SessionEvent::Title(info.msg_title)).await,
                    Err(e) => self.api_failed("conversation info", &e).await,
                }
            }
            TaskResult::Conversations(Ok(list)) => {
                self.emit(SessionEvent::Conversations(list)).await;
            }
            TaskResult::Conversations(Err(e)) => self.api_failed("conversation list", &e).await,
            TaskResult::Page { request, result } => self.handle_page(&request, result).await,
            TaskResult::Connected {
                conversation,
                epoch,
                result,
            } => self.handle_connected(conversation, epoch, result).await,
            TaskResult::Sent {
                conversation,
                outcome,
            } => self.handle_sent(conversation, outcome).await,
        }
    }

    async fn handle_page(&mut self, request: &FetchRequest, result: Result<Vec<Message>, ApiError>) {
        match result {
            Ok(page) => {
                let len = page.len();
                let outcome = self.engine.apply_page(request, page);
                if !outcome.changed {
                    return;
                }
                tracing::debug!(
                    conversation = %request.conversation,
                    offset = %request.offset,
                    len,
                    "history page merged"
                );
                self.publish(outcome).await;
                self.emit(SessionEvent::Loading(self.engine.is_loading()))
                    .await;
            }
            Err(e) => {
                if !self.engine.page_failed(request).changed {
                    return;
                }
                self.emit(SessionEvent::Loading(false)).await;
                self.api_failed("history", &e).await;
            }
        }
    }

    async fn handle_connected(
        &mut self,
        conversation: ConversationId,
        epoch: u64,
        result: Result<(Arc<C::Channel>, Inbound), ChannelError>,
    ) {
        let current = epoch == self.engine.epoch() && self.engine.conversation() == Some(&conversation);
        match result {
            Ok((channel, inbound)) if current => {
                self.teardown_channel();
                self.active = Some(ActiveChannel {
                    conversation: conversation.clone(),
                    channel,
                    inbound,
                });
                self.emit(SessionEvent::ConnectionStatus {
                    conversation,
                    connected: true,
                })
                .await;
            }
            Ok((channel, _)) => {
                tracing::debug!(%conversation, "dropping subscription for inactive conversation");
                channel.disconnect();
            }
            Err(e) if current => {
                tracing::warn!(%conversation, error = %e, "could not subscribe");
                self.emit(SessionEvent::ConnectionStatus {
                    conversation,
                    connected: false,
                })
                .await;
                self.emit(SessionEvent::Warning(format!("could not connect: {e}")))
                    .await;
            }
            Err(e) => tracing::debug!(%conversation, error = %e, "stale subscription failed"),
        }
    }

    async fn handle_sent(&mut self, conversation: ConversationId, outcome: SendOutcome) {
        match outcome {
            SendOutcome::Confirmed { message, attempts } => {
                tracing::debug!(%conversation, attempts, "send confirmed");
                let outcome = self.engine.apply_confirmed(&conversation, message.clone());
                if outcome.changed {
                    self.log.append(&conversation, &message).await;
                }
                self.publish(outcome).await;
            }
            SendOutcome::Abandoned {
                message,
                attempts,
                last_error,
            } => {
                if self.engine.conversation() != Some(&conversation) {
                    tracing::debug!(
                        %conversation,
                        attempts,
                        error = %last_error,
                        "send for a conversation no longer open was abandoned"
                    );
                    return;
                }
                self.emit(SessionEvent::SendAbandoned {
                    conversation,
                    content: message.content,
                    attempts,
                    reason: last_error.to_string(),
                })
                .await;
            }
        }
    }

    async fn api_failed(&self, what: &str, error: &ApiError) {
        if matches!(error, ApiError::Unauthorized) {
            tracing::info!(what, "not logged in");
            self.emit(SessionEvent::RedirectToLogin).await;
        } else {
            tracing::warn!(what, error = %error, "API request failed");
            self.emit(SessionEvent::Warning(format!("{what} failed: {error}")))
                .await;
        }
    }

    fn teardown_channel(&mut self) {
        if let Some(active) = self.active.take() {
            active.channel.disconnect();
        }
    }

    fn spawn_fetch(&self, request: FetchRequest) {
        let history = Arc::clone(&self.history);
        let results = self.results.clone();
        tokio::spawn(async move {
            let result = history
                .fetch_page(&request.conversation, &request.offset)
                .await;
            let _ = results.send(TaskResult::Page { request, result });
        });
    }

    fn spawn_connect(&self, conversation: ConversationId) {
        let connector = Arc::clone(&self.connector);
        let log = Arc::clone(&self.log);
        let results = self.results.clone();
        let epoch = self.engine.epoch();
        tokio::spawn(async move {
            let resume = Offset::from(log.latest_offset(&conversation).await);
            let result = connector
                .connect(&conversation, &resume)
                .await
                .map(|(channel, inbound)| (Arc::new(channel), inbound));
            let _ = results.send(TaskResult::Connected {
                conversation,
                epoch,
                result,
            });
        });
    }

    fn spawn_title(&self, conversation: ConversationId) {
        let api = Arc::clone(&self.api);
        let results = self.results.clone();
        tokio::spawn(async move {
            let result = api.conversation_info(&conversation).await;
            let _ = results.send(TaskResult::Title {
                conversation,
                result,
            });
        });
    }

    fn spawn_identity_lookup(&self) {
        let api = Arc::clone(&self.api);
        let results = self.results.clone();
        tokio::spawn(async move {
            let _ = results.send(TaskResult::Identity(api.whoami().await));
        });
    }

    fn spawn_list(&self) {
        let api = Arc::clone(&self.api);
        let results = self.results.clone();
        tokio::spawn(async move {
            let _ = results.send(TaskResult::Conversations(api.list_conversations().await));
        });
    }
}

/// Next push on the active channel; pends forever when there is none.
async fn next_inbound<Ch>(active: &mut Option<ActiveChannel<Ch>>) -> Option<Message> {
    match active {
        Some(active) => active.inbound.recv().await,
        None => std::future::pending().await,
    }
}
