// Exchange, queue and binding descriptors and their declare operations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, Span};

use super::errors::{ConfigError, Result};
use super::transport::BrokerChannel;

/// Broker arguments, passed through untouched apart from the few keys the
/// retry logic needs to look at.
pub type Arguments = BTreeMap<String, Value>;

pub const DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
pub const DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
pub const MESSAGE_TTL: &str = "x-message-ttl";
pub const QUEUE_TYPE: &str = "x-queue-type";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Topic,
    Fanout,
    Headers,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub name: String,
    #[serde(default)]
    pub kind: ExchangeKind,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub internal: bool,
    #[serde(default)]
    pub no_wait: bool,
    #[serde(default)]
    pub args: Arguments,
}

impl ExchangeConfig {
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            ..Self::default()
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        // The default exchange "" always exists and cannot be declared.
        if self.name.trim().is_empty() {
            return Err(ConfigError::Missing("exchange"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub no_wait: bool,
    #[serde(default)]
    pub args: Arguments,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    /// Routes rejected messages to `exchange` with `routing_key`.
    pub fn with_dead_letter(mut self, exchange: &str, routing_key: Option<&str>) -> Self {
        self.args
            .insert(DEAD_LETTER_EXCHANGE.to_string(), Value::from(exchange));
        if let Some(key) = routing_key {
            self.args
                .insert(DEAD_LETTER_ROUTING_KEY.to_string(), Value::from(key));
        }
        self
    }

    pub fn with_message_ttl(mut self, ttl_ms: u64) -> Self {
        self.args.insert(MESSAGE_TTL.to_string(), Value::from(ttl_ms));
        self
    }

    pub fn with_queue_type(mut self, queue_type: &str) -> Self {
        self.args
            .insert(QUEUE_TYPE.to_string(), Value::from(queue_type));
        self
    }

    pub fn dead_letter_exchange(&self) -> Option<&str> {
        self.args.get(DEAD_LETTER_EXCHANGE).and_then(Value::as_str)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Missing("queue"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueBindConfig {
    pub queue: String,
    pub exchange: String,
    #[serde(default)]
    pub binding_key: String,
    #[serde(default)]
    pub no_wait: bool,
    #[serde(default)]
    pub args: Arguments,
}

impl QueueBindConfig {
    pub fn new(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        binding_key: impl Into<String>,
    ) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            binding_key: binding_key.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.queue.trim().is_empty() || self.exchange.trim().is_empty() {
            return Err(ConfigError::Missing("queue bind"));
        }
        Ok(())
    }
}

#[async_trait]
pub trait Exchange: Send + Sync {
    fn name(&self) -> &str;

    fn config(&self) -> &ExchangeConfig;

    async fn declare(&self, channel: &dyn BrokerChannel) -> Result<()>;
}

#[async_trait]
pub trait Queue: Send + Sync {
    fn name(&self) -> &str;

    fn config(&self) -> &QueueConfig;

    async fn declare(&self, channel: &dyn BrokerChannel) -> Result<()>;

    async fn bind(&self, channel: &dyn BrokerChannel, binding: &QueueBindConfig) -> Result<()>;
}

pub struct RmqExchange {
    config: ExchangeConfig,
    span: Span,
}

impl RmqExchange {
    pub fn new(config: ExchangeConfig, span: Span) -> Self {
        Self { config, span }
    }
}

#[async_trait]
impl Exchange for RmqExchange {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    async fn declare(&self, channel: &dyn BrokerChannel) -> Result<()> {
        channel.exchange_declare(&self.config).await?;
        debug!(parent: &self.span, exchange = %self.config.name, kind = ?self.config.kind, "exchange declared");
        Ok(())
    }
}

pub struct RmqQueue {
    config: QueueConfig,
    span: Span,
}

impl RmqQueue {
    pub fn new(config: QueueConfig, span: Span) -> Self {
        Self { config, span }
    }
}

#[async_trait]
impl Queue for RmqQueue {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn config(&self) -> &QueueConfig {
        &self.config
    }

    async fn declare(&self, channel: &dyn BrokerChannel) -> Result<()> {
        let declared = channel.queue_declare(&self.config).await?;
        debug!(parent: &self.span, queue = %declared, "queue declared");
        Ok(())
    }

    async fn bind(&self, channel: &dyn BrokerChannel, binding: &QueueBindConfig) -> Result<()> {
        channel.queue_bind(binding).await?;
        debug!(
            parent: &self.span,
            queue = %binding.queue,
            exchange = %binding.exchange,
            binding_key = %binding.binding_key,
            "queue bound"
        );
        Ok(())
    }
}
