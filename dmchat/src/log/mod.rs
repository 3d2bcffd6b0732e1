//! Local message log and failure-resilient appending.
//!
//! The log is an append-only, per-conversation record of confirmed
//! messages. Its only role in reconciliation is to supply the resume offset
//! (the id of the most recently recorded message) when a delivery channel
//! subscribes.
//!
//! [`ResilientLogWriter`] wraps any [`MessageLog`] so that a failed append
//! never disrupts message display: the failure is logged, queued for retry
//! and reported as a [`LogWarning`].

mod file;

pub use file::FileLog;

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::Mutex;

use dmchat_proto::codec::CodecError;
use dmchat_proto::message::{ConversationId, Message, MessageId};

/// Why a log operation failed.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// A storage backend rejected the operation.
    #[error("log backend: {0}")]
    Backend(String),

    /// Only server-confirmed messages may be recorded.
    #[error("message has no server id")]
    Unconfirmed,

    /// Filesystem error.
    #[error("log I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be encoded or decoded.
    #[error("log record error: {0}")]
    Codec(#[from] CodecError),
}

/// Append-only record of confirmed messages, partitioned by conversation.
pub trait MessageLog: Send + Sync {
    /// Append a confirmed message to a conversation's log.
    fn append(
        &self,
        conversation: &ConversationId,
        message: &Message,
    ) -> impl std::future::Future<Output = Result<(), LogError>> + Send;

    /// Id of the most recently appended message, or `None` when the
    /// conversation has no entries.
    fn latest_offset(
        &self,
        conversation: &ConversationId,
    ) -> impl std::future::Future<Output = Result<Option<MessageId>, LogError>> + Send;

    /// Every recorded message of a conversation, in append order.
    fn load(
        &self,
        conversation: &ConversationId,
    ) -> impl std::future::Future<Output = Result<Vec<Message>, LogError>> + Send;
}

/// An append that failed and is waiting to be retried.
#[derive(Debug, Clone)]
struct PendingAppend {
    conversation: ConversationId,
    message: Message,
}

/// Warning emitted when a log append fails.
#[derive(Debug, Clone)]
pub enum LogWarning {
    /// A message was displayed but could not be recorded locally.
    AppendFailed {
        /// The conversation the message belongs to.
        conversation: ConversationId,
        /// The id of the message that could not be recorded.
        message_id: Option<MessageId>,
        /// Description of the error.
        reason: String,
    },
}

impl std::fmt::Display for LogWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AppendFailed { reason, .. } => {
                write!(f, "message shown but not saved locally: {reason}")
            }
        }
    }
}

/// Wraps a [`MessageLog`] to handle append failures gracefully.
///
/// Failed appends are logged, queued, and reported on the warning channel.
/// They can be retried with [`flush_pending`](Self::flush_pending) or by a
/// background task from [`spawn_retry_task`](Self::spawn_retry_task).
/// Speculative messages are never recorded.
pub struct ResilientLogWriter<L: MessageLog> {
    log: L,
    pending: Mutex<VecDeque<PendingAppend>>,
    warning_tx: tokio::sync::mpsc::Sender<LogWarning>,
}

impl<L: MessageLog> ResilientLogWriter<L> {
    /// Create a new resilient writer wrapping the given log.
    ///
    /// Returns the writer and a receiver for [`LogWarning`] events.
    #[must_use]
    pub fn new(log: L, warning_buffer: usize) -> (Self, tokio::sync::mpsc::Receiver<LogWarning>) {
        let (tx, rx) = tokio::sync::mpsc::channel(warning_buffer);
        let writer = Self {
            log,
            pending: Mutex::new(VecDeque::new()),
            warning_tx: tx,
        };
        (writer, rx)
    }

    /// Append a confirmed message, never failing the caller.
    pub async fn append(&self, conversation: &ConversationId, message: &Message) {
        if !message.is_confirmed() {
            tracing::debug!(%conversation, "refusing to record a speculative message");
            return;
        }
        if let Err(err) = self.log.append(conversation, message).await {
            tracing::warn!(
                %conversation,
                message_id = ?message.id,
                error = %err,
                "log append failed, message shown but not recorded"
            );

            self.pending.lock().await.push_back(PendingAppend {
                conversation: conversation.clone(),
                message: message.clone(),
            });

            let _ = self.warning_tx.try_send(LogWarning::AppendFailed {
                conversation: conversation.clone(),
                message_id: message.id.clone(),
                reason: err.to_string(),
            });
        }
    }

    /// Resume offset for a conversation.
    ///
    /// A read failure is logged and treated as an empty log, so the channel
    /// subscribes from the latest message.
    pub async fn latest_offset(&self, conversation: &ConversationId) -> Option<MessageId> {
        match self.log.latest_offset(conversation).await {
            Ok(offset) => offset,
            Err(err) => {
                tracing::warn!(%conversation, error = %err, "could not read resume offset");
                None
            }
        }
    }

    /// Delegate reads directly to the underlying log.
    ///
    /// # Errors
    ///
    /// Returns [`LogError`] if the underlying read fails.
    pub async fn load(&self, conversation: &ConversationId) -> Result<Vec<Message>, LogError> {
        self.log.load(conversation).await
    }

    /// Retries every queued append once, in queue order.
    ///
    /// Appends that fail again go back to the front of the queue, ahead of
    /// anything queued while the flush ran. Returns how many were recorded.
    pub async fn flush_pending(&self) -> usize {
        let queued = std::mem::take(&mut *self.pending.lock().await);
        if queued.is_empty() {
            return 0;
        }

        let attempted = queued.len();
        let mut failed = VecDeque::new();
        for entry in queued {
            if let Err(err) = self.log.append(&entry.conversation, &entry.message).await {
                tracing::debug!(conversation = %entry.conversation, error = %err, "retry failed");
                failed.push_back(entry);
            }
        }

        let recorded = attempted - failed.len();
        if recorded > 0 {
            tracing::info!(recorded, still_pending = failed.len(), "recorded queued log appends");
        }
        let mut pending = self.pending.lock().await;
        failed.append(&mut pending);
        *pending = failed;
        recorded
    }

    /// Number of appends waiting for a retry.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Flushes the queue every `interval` until the handle is aborted.
    ///
    /// The first flush happens one interval after the call.
    pub fn spawn_retry_task(
        self: &std::sync::Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()>
    where
        L: 'static,
    {
        let writer = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticks = tokio::time::interval_at(start, interval);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                writer.flush_pending().await;
            }
        })
    }
}

/// In-memory implementation of [`MessageLog`].
///
/// Nothing survives the process; used by tests and when no log directory
/// is configured.
#[derive(Default)]
pub struct InMemoryLog {
    entries: Mutex<HashMap<ConversationId, Vec<Message>>>,
}

impl InMemoryLog {
    /// Create a new, empty in-memory log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageLog for InMemoryLog {
    async fn append(&self, conversation: &ConversationId, message: &Message) -> Result<(), LogError> {
        if !message.is_confirmed() {
            return Err(LogError::Unconfirmed);
        }
        self.entries
            .lock()
            .await
            .entry(conversation.clone())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn latest_offset(
        &self,
        conversation: &ConversationId,
    ) -> Result<Option<MessageId>, LogError> {
        Ok(self
            .entries
            .lock()
            .await
            .get(conversation)
            .and_then(|messages| messages.last())
            .and_then(|message| message.id.clone()))
    }

    async fn load(&self, conversation: &ConversationId) -> Result<Vec<Message>, LogError> {
        Ok(self
            .entries
            .lock()
            .await
            .get(conversation)
            .cloned()
            .unwrap_or_default())
    }
}
