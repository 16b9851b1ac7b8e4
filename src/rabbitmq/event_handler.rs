// src/rabbitmq/event_handler.rs

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, warn, Span};

use super::message::{Message, RedeliveryInfo};
use super::options::MessageRetryConfig;

/// Application callbacks for consumed messages.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn process_event(&self, message: &Message) -> anyhow::Result<()>;

    /// Called for messages that will not be retried any more, when dead
    /// message handling is enabled. Errors are logged and otherwise ignored.
    async fn process_dead_message(
        &self,
        message: &Message,
        cause: &DeadLetterCause,
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterCause {
    RetryLimitExceeded { count: i64, limit: u32 },
    HandlerFailed(String),
}

impl fmt::Display for DeadLetterCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadLetterCause::RetryLimitExceeded { count, limit } => {
                write!(f, "retry count {count} exceeded limit {limit}")
            }
            DeadLetterCause::HandlerFailed(reason) => write!(f, "handler failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureAction {
    DeadLetter(DeadLetterCause),
    Retry { requeue: bool },
}

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Processed,
    Retried { requeue: bool },
    DeadLettered(DeadLetterCause),
    /// The handler failed but the delivery had already been settled.
    Failed,
}

/// Bounded-retry decisions. Holds no per-message state: counts come from
/// the delivery headers every time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub handle_dead_message: bool,
    pub retry_count_limit: u32,
    pub dead_letter_path: bool,
}

impl RetryPolicy {
    /// `dead_letter_path` says whether the consumed queue routes rejected
    /// messages to a dead-letter exchange; the config can override it.
    pub fn new(config: &MessageRetryConfig, dead_letter_path: bool) -> Self {
        Self {
            enabled: config.enabled,
            handle_dead_message: config.handle_dead_message,
            retry_count_limit: config.retry_count_limit,
            dead_letter_path: config.dead_letter_retry.unwrap_or(dead_letter_path),
        }
    }

    fn limit_exceeded(&self, info: &RedeliveryInfo) -> Option<DeadLetterCause> {
        let limit = i64::from(self.retry_count_limit);
        if !info.exceeds(limit) {
            return None;
        }
        let count = info
            .delivery_count
            .into_iter()
            .chain(info.latest_death_count)
            .max()
            .unwrap_or_default();
        Some(DeadLetterCause::RetryLimitExceeded {
            count,
            limit: self.retry_count_limit,
        })
    }

    /// Checked before the handler runs, whether or not retries are enabled.
    pub fn exceeded(&self, info: &RedeliveryInfo) -> Option<DeadLetterCause> {
        self.limit_exceeded(info)
    }

    pub fn on_failure(&self, info: &RedeliveryInfo, error: &anyhow::Error) -> FailureAction {
        if !self.enabled {
            return FailureAction::DeadLetter(DeadLetterCause::HandlerFailed(format!("{error:#}")));
        }
        if !info.has_history() {
            return FailureAction::Retry { requeue: false };
        }
        if let Some(cause) = self.limit_exceeded(info) {
            return FailureAction::DeadLetter(cause);
        }
        FailureAction::Retry {
            requeue: !self.dead_letter_path,
        }
    }
}

/// Runs one delivery through the handler and settles it exactly once.
pub struct DeliveryProcessor {
    handler: Arc<dyn MessageHandler>,
    policy: RetryPolicy,
    auto_ack: bool,
    span: Span,
}

impl DeliveryProcessor {
    pub fn new(handler: Arc<dyn MessageHandler>, policy: RetryPolicy, auto_ack: bool, span: Span) -> Self {
        Self {
            handler,
            policy,
            auto_ack,
            span,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn process(&self, message: Message) -> Outcome {
        debug!(parent: &self.span, message_id = message.id(), "message received");

        if self.auto_ack {
            if let Err(err) = message.ack().await {
                error!(parent: &self.span, message_id = message.id(), error = %err, "auto ack failed");
            }
        }

        let info = message.redelivery();
        if let Some(cause) = self.policy.exceeded(&info) {
            debug!(parent: &self.span, message_id = message.id(), %cause, "retry limit reached before processing");
            return self.dead_letter(&message, cause).await;
        }

        let err = match self.handler.process_event(&message).await {
            Ok(()) => {
                self.ack(&message).await;
                debug!(parent: &self.span, message_id = message.id(), "message processed");
                return Outcome::Processed;
            }
            Err(err) => err,
        };

        warn!(parent: &self.span, message_id = message.id(), error = %format!("{err:#}"), "handler failed");
        match self.policy.on_failure(&info, &err) {
            FailureAction::DeadLetter(cause) => self.dead_letter(&message, cause).await,
            FailureAction::Retry { requeue } => {
                if message.is_settled() {
                    debug!(parent: &self.span, message_id = message.id(), "already settled, not retrying");
                    return Outcome::Failed;
                }
                if let Err(err) = message.nack(requeue).await {
                    error!(parent: &self.span, message_id = message.id(), error = %err, "nack failed");
                }
                debug!(
                    parent: &self.span,
                    message_id = message.id(),
                    requeue,
                    delivery_count = ?info.delivery_count,
                    death_count = ?info.latest_death_count,
                    "message sent back for retry"
                );
                Outcome::Retried { requeue }
            }
        }
    }

    async fn dead_letter(&self, message: &Message, cause: DeadLetterCause) -> Outcome {
        debug!(parent: &self.span, message_id = message.id(), %cause, "dead message");
        if self.policy.handle_dead_message {
            if let Err(err) = self.handler.process_dead_message(message, &cause).await {
                error!(
                    parent: &self.span,
                    message_id = message.id(),
                    error = %format!("{err:#}"),
                    "dead message handler failed"
                );
            }
        }
        self.ack(message).await;
        Outcome::DeadLettered(cause)
    }

    async fn ack(&self, message: &Message) {
        if message.is_settled() {
            debug!(parent: &self.span, message_id = message.id(), "already settled, skipping ack");
            return;
        }
        if let Err(err) = message.ack().await {
            error!(parent: &self.span, message_id = message.id(), error = %err, "ack failed");
        }
    }
}
