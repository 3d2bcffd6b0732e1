//! Send pipeline: validation, submission, acknowledgment, retry.
//!
//! Raw composer text becomes a speculative [`Message`] wrapped in a
//! [`RetryEnvelope`]. Each attempt submits the same message (same content,
//! same client nonce) and waits for an acknowledgment. A failed attempt
//! spends one unit of the retry budget; the pipeline keeps going while the
//! budget is non-negative, so a budget of `N` allows `N + 1` attempts.

use std::time::Duration;

use uuid::Uuid;

use dmchat_proto::message::{
    DEFAULT_RETRY_TIMES, EventName, Message, ValidationError, validate_content,
};

use crate::channel::{ChannelError, DeliveryChannel};

/// Sender name used until the logged-in identity is known.
pub const DEFAULT_SENDER: &str = "Yourself";

/// Default acknowledgment timeout per attempt.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(2000);

/// Configuration for acknowledgment timeout and retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries granted after the first attempt fails.
    pub retry_times: i32,
    /// How long to wait for each acknowledgment.
    pub ack_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_times: DEFAULT_RETRY_TIMES,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }
}

/// A speculative message together with its remaining retry budget.
///
/// The budget travels in the message itself (`ext.retryTimes`) so every
/// attempt reports how many retries remain after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEnvelope {
    message: Message,
}

impl RetryEnvelope {
    /// Wrap `message` with `retry_times` retries and a fresh client nonce.
    #[must_use]
    pub fn new(mut message: Message, retry_times: i32) -> Self {
        message.ext.retry_times = retry_times;
        message.ext.client_nonce.get_or_insert_with(Uuid::now_v7);
        Self { message }
    }

    /// The message submitted on each attempt.
    #[must_use]
    pub const fn message(&self) -> &Message {
        &self.message
    }

    /// Retries remaining.
    #[must_use]
    pub const fn remaining(&self) -> i32 {
        self.message.ext.retry_times
    }

    /// Spend one retry after a failed attempt.
    ///
    /// Returns `true` if another attempt may be made.
    pub fn record_failure(&mut self) -> bool {
        self.message.ext.retry_times -= 1;
        self.message.ext.retry_times >= 0
    }

    /// Unwrap the message.
    #[must_use]
    pub fn into_message(self) -> Message {
        self.message
    }
}

/// Final result of one submission.
#[derive(Debug)]
pub enum SendOutcome {
    /// The server acknowledged with an id; `message` carries it.
    Confirmed {
        /// The now-canonical message.
        message: Message,
        /// Attempts made, including the successful one.
        attempts: u32,
    },
    /// Every attempt failed; nothing will be displayed.
    Abandoned {
        /// The message that could not be delivered.
        message: Message,
        /// Attempts made.
        attempts: u32,
        /// Error of the last attempt.
        last_error: ChannelError,
    },
}

impl SendOutcome {
    /// Attempts made before the outcome was decided.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Confirmed { attempts, .. } | Self::Abandoned { attempts, .. } => *attempts,
        }
    }

    /// The confirmed message, if delivery succeeded.
    #[must_use]
    pub const fn confirmed(&self) -> Option<&Message> {
        match self {
            Self::Confirmed { message, .. } => Some(message),
            Self::Abandoned { .. } => None,
        }
    }
}

/// Validates and delivers outgoing messages.
#[derive(Debug, Clone, Default)]
pub struct SendPipeline {
    config: RetryConfig,
}

impl SendPipeline {
    /// Create a pipeline with the given retry settings.
    #[must_use]
    pub const fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Retry settings in use.
    #[must_use]
    pub const fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Validate raw composer text and build the envelope for it.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] for empty or over-long text. Nothing is
    /// transmitted in that case.
    pub fn prepare(&self, raw_text: &str, sender: &str) -> Result<RetryEnvelope, ValidationError> {
        if let Err(e) = validate_content(raw_text) {
            tracing::info!(error = %e, "invalid input, message not sent");
            return Err(e);
        }
        Ok(RetryEnvelope::new(
            Message::speculative(raw_text, sender),
            self.config.retry_times,
        ))
    }

    /// Submit the envelope on `channel` until it is acknowledged or the
    /// retry budget runs out.
    ///
    /// Timeouts and acknowledgments without an id spend budget. A closed
    /// channel abandons the message immediately.
    pub async fn deliver<C: DeliveryChannel>(
        &self,
        channel: &C,
        mut envelope: RetryEnvelope,
    ) -> SendOutcome {
        let event = EventName::for_conversation(channel.conversation());
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let error = match channel
                .send(&event, envelope.message(), self.config.ack_timeout)
                .await
            {
                Ok(ack) => {
                    let mut message = envelope.into_message();
                    message.id = Some(ack.message_id);
                    tracing::debug!(attempts, id = ?message.id, "message confirmed");
                    return SendOutcome::Confirmed { message, attempts };
                }
                Err(e) => e,
            };

            if !error.is_retryable() {
                tracing::warn!(attempts, error = %error, "channel unusable, abandoning message");
                return SendOutcome::Abandoned {
                    message: envelope.into_message(),
                    attempts,
                    last_error: error,
                };
            }

            if !envelope.record_failure() {
                tracing::info!(attempts, error = %error, "ran out of retry times, abandoning message");
                return SendOutcome::Abandoned {
                    message: envelope.into_message(),
                    attempts,
                    last_error: error,
                };
            }

            tracing::debug!(
                attempt = attempts,
                remaining = envelope.remaining(),
                error = %error,
                "emit failed, going to retry"
            );
        }
    }

    /// Validate `raw_text` and deliver it.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if the text is rejected before sending.
    pub async fn submit<C: DeliveryChannel>(
        &self,
        channel: &C,
        raw_text: &str,
        sender: &str,
    ) -> Result<SendOutcome, ValidationError> {
        let envelope = self.prepare(raw_text, sender)?;
        Ok(self.deliver(channel, envelope).await)
    }
}
