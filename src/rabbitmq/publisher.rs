use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, info_span, warn, Span};
use uuid::Uuid;

use super::errors::{RabbitMQError, Result};
use super::options::{PublishOptions, PublisherConfig};
use super::publishing::Publishing;
use super::transport::{BrokerChannel, Confirmation, PublishFlags, ReturnedMessage};

#[derive(Clone)]
struct Attached {
    channel: Arc<dyn BrokerChannel>,
    confirming: bool,
}

/// Publishes to one exchange over the publisher channel.
///
/// Unroutable mandatory publishes are reported by the broker alongside
/// publisher confirms, so the channel is switched to confirm mode whenever
/// `mandatory` is in effect, even if confirms were not asked for.
pub struct Publisher {
    exchange: String,
    config: PublisherConfig,
    channel: RwLock<Option<Attached>>,
    returns: mpsc::UnboundedSender<ReturnedMessage>,
    span: Span,
}

impl Publisher {
    pub fn new(
        exchange: impl Into<String>,
        config: PublisherConfig,
        returns: mpsc::UnboundedSender<ReturnedMessage>,
        span: Span,
    ) -> Self {
        let exchange = exchange.into();
        let span = info_span!(parent: &span, "publisher", name = %config.name, exchange = %exchange);
        Self {
            exchange,
            config,
            channel: RwLock::new(None),
            returns,
            span,
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Switches to `channel`, selecting confirm mode on it when configured.
    /// Called once at creation and again after every reconnect.
    pub async fn attach(&self, channel: Arc<dyn BrokerChannel>) -> Result<()> {
        let confirming = self.config.publisher_confirmed || self.config.mandatory;
        if confirming {
            channel.confirm_select().await?;
        }
        debug!(
            parent: &self.span,
            channel = channel.id(),
            confirmed = self.config.publisher_confirmed,
            confirming,
            "publisher attached"
        );
        *self.channel.write().await = Some(Attached { channel, confirming });
        Ok(())
    }

    /// The attached channel, switched to confirm mode first when a mandatory
    /// publish needs returns and the channel is not confirming yet.
    async fn channel_for(&self, mandatory: bool) -> Result<Arc<dyn BrokerChannel>> {
        let current = self.channel.read().await.clone().ok_or(RabbitMQError::NotConnected)?;
        if !mandatory || current.confirming {
            return Ok(current.channel);
        }

        let mut slot = self.channel.write().await;
        let attached = slot.as_mut().ok_or(RabbitMQError::NotConnected)?;
        if !attached.confirming {
            attached.channel.confirm_select().await?;
            attached.confirming = true;
            debug!(parent: &self.span, channel = attached.channel.id(), "confirm mode selected for mandatory publishing");
        }
        Ok(Arc::clone(&attached.channel))
    }

    /// Publishes `body` using the publisher defaults overridden by `options`.
    pub async fn send(&self, body: Vec<u8>, options: PublishOptions) -> Result<String> {
        let exchange = options.exchange.unwrap_or_else(|| self.exchange.clone());
        let routing_key = options
            .routing_key
            .unwrap_or_else(|| self.config.routing_key.clone());
        let flags = PublishFlags {
            mandatory: options.mandatory.unwrap_or(self.config.mandatory),
            immediate: options.immediate.unwrap_or(self.config.immediate),
        };
        let auto_generate = options
            .auto_generate_message_id
            .unwrap_or(self.config.auto_generate_message_id);
        let mut publishing = options.publishing.unwrap_or_default();
        publishing.body = body;

        self.publish_with(&exchange, &routing_key, publishing, flags, auto_generate)
            .await
    }

    pub async fn publish(&self, exchange: &str, routing_key: &str, publishing: Publishing) -> Result<String> {
        let flags = PublishFlags {
            mandatory: self.config.mandatory,
            immediate: self.config.immediate,
        };
        self.publish_with(
            exchange,
            routing_key,
            publishing,
            flags,
            self.config.auto_generate_message_id,
        )
        .await
    }

    /// Returns the message id the envelope went out with (empty when none
    /// was set and none was generated).
    pub async fn publish_with(
        &self,
        exchange: &str,
        routing_key: &str,
        mut publishing: Publishing,
        flags: PublishFlags,
        auto_generate_id: bool,
    ) -> Result<String> {
        if auto_generate_id && publishing.id().is_none() {
            publishing.message_id = Some(Uuid::new_v4().to_string());
        }
        let message_id = publishing.message_id.clone().unwrap_or_default();

        let channel = self.channel_for(flags.mandatory).await?;

        let pending = channel
            .publish(exchange, routing_key, flags, &publishing)
            .await
            .inspect_err(|err| {
                error!(parent: &self.span, message_id = %message_id, exchange, routing_key, error = %err, "publish failed");
            })?;

        if !self.config.publisher_confirmed && !flags.mandatory {
            debug!(parent: &self.span, message_id = %message_id, exchange, routing_key, "message published");
            return Ok(message_id);
        }

        let wait = self.config.timeout();
        let confirmation = match timeout(wait, pending).await {
            Ok(confirmation) => confirmation?,
            Err(_) => {
                error!(parent: &self.span, message_id = %message_id, timeout = ?wait, "publish not confirmed in time");
                return Err(RabbitMQError::ConfirmTimeout {
                    message_id,
                    timeout: wait,
                });
            }
        };

        match confirmation {
            Confirmation::Ack | Confirmation::NotRequested => {
                debug!(parent: &self.span, message_id = %message_id, exchange, routing_key, "message confirmed");
                Ok(message_id)
            }
            Confirmation::Nack => {
                error!(parent: &self.span, message_id = %message_id, "broker rejected message");
                Err(RabbitMQError::PublishRejected { message_id })
            }
            Confirmation::Returned(returned) => {
                warn!(
                    parent: &self.span,
                    message_id = %message_id,
                    reply_code = returned.reply_code,
                    reply_text = %returned.reply_text,
                    "message returned as unroutable"
                );
                if self.returns.send(returned).is_err() {
                    error!(parent: &self.span, message_id = %message_id, "returned message lost: receiver dropped");
                }
                Ok(message_id)
            }
        }
    }
}
