//! Typed configuration for the queue manager and its operations.
//!
//! Every struct deserializes from JSON with the same field names the config
//! file uses; durations are stored as milliseconds.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::errors::ConfigError;
use super::publishing::Publishing;
use super::topology::{Arguments, QueueBindConfig, QueueConfig};

fn default_true() -> bool {
    true
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_max_attempt() -> u32 {
    5
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_connection_name() -> String {
    "rmq-manager".to_string()
}

fn default_concurrency() -> usize {
    1
}

/// Fixed-interval reconnect policy: `max_attempt` retries after the first try.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_max_attempt")]
    pub max_attempt: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            max_attempt: default_max_attempt(),
        }
    }
}

impl ReconnectConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueManagerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub conn_uris: Vec<String>,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default = "default_true")]
    pub enable_publisher: bool,
    #[serde(default = "default_true")]
    pub enable_consumer: bool,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default = "default_connection_name")]
    pub connection_name: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for QueueManagerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            conn_uris: Vec::new(),
            auto_reconnect: true,
            enable_publisher: true,
            enable_consumer: true,
            reconnect: ReconnectConfig::default(),
            connection_name: default_connection_name(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl QueueManagerConfig {
    pub fn new(conn_uris: Vec<String>) -> Self {
        Self {
            conn_uris,
            ..Self::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Err(ConfigError::Disabled);
        }
        if self.conn_uris.is_empty() {
            return Err(ConfigError::Missing("conn_uris"));
        }
        if let Some(uri) = self
            .conn_uris
            .iter()
            .find(|uri| !(uri.starts_with("amqp://") || uri.starts_with("amqps://")))
        {
            return Err(ConfigError::invalid(
                "conn_uris",
                format!("unsupported scheme in {uri}"),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub routing_key: String,
    #[serde(default)]
    pub mandatory: bool,
    #[serde(default)]
    pub immediate: bool,
    #[serde(default)]
    pub auto_generate_message_id: bool,
    #[serde(default)]
    pub publisher_confirmed: bool,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            routing_key: String::new(),
            mandatory: false,
            immediate: false,
            auto_generate_message_id: false,
            publisher_confirmed: false,
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl PublisherConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    pub queue: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub auto_ack: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub no_local: bool,
    #[serde(default)]
    pub no_wait: bool,
    #[serde(default)]
    pub args: Arguments,
    #[serde(default)]
    pub enabled_prefetch: bool,
    #[serde(default)]
    pub prefetch_count: u16,
    /// Must stay 0: the client library has no way to send a byte window.
    #[serde(default)]
    pub prefetch_size: u32,
    #[serde(default)]
    pub global: bool,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            queue: String::new(),
            name: String::new(),
            auto_ack: false,
            exclusive: false,
            no_local: false,
            no_wait: false,
            args: Arguments::new(),
            enabled_prefetch: false,
            prefetch_count: 0,
            prefetch_size: 0,
            global: false,
            concurrency: default_concurrency(),
        }
    }
}

impl ConsumerConfig {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..Self::default()
        }
    }

    pub fn with_prefetch(mut self, count: u16) -> Self {
        self.enabled_prefetch = true;
        self.prefetch_count = count;
        self
    }

    pub fn with_concurrency(mut self, workers: usize) -> Self {
        self.concurrency = workers;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.trim().is_empty() {
            return Err(ConfigError::Missing("queue"));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::invalid("concurrency", "must be at least 1"));
        }
        if self.prefetch_size != 0 {
            return Err(ConfigError::invalid("prefetch_size", "only 0 (no byte limit) is supported"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRetryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub handle_dead_message: bool,
    #[serde(default)]
    pub retry_count_limit: u32,
    /// Forces the dead-letter retry path on or off for queues declared
    /// outside this manager. When unset it follows the queue arguments.
    #[serde(default)]
    pub dead_letter_retry: Option<bool>,
}

/// Per-publish overrides. Unset fields fall back to the publisher config.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub exchange: Option<String>,
    pub routing_key: Option<String>,
    pub mandatory: Option<bool>,
    pub immediate: Option<bool>,
    pub auto_generate_message_id: Option<bool>,
    pub publishing: Option<Publishing>,
}

impl PublishOptions {
    pub fn builder() -> PublishOptionsBuilder {
        PublishOptionsBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct PublishOptionsBuilder {
    options: PublishOptions,
}

impl PublishOptionsBuilder {
    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.options.exchange = Some(exchange.into());
        self
    }

    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.options.routing_key = Some(routing_key.into());
        self
    }

    pub fn mandatory(mut self, mandatory: bool) -> Self {
        self.options.mandatory = Some(mandatory);
        self
    }

    pub fn immediate(mut self, immediate: bool) -> Self {
        self.options.immediate = Some(immediate);
        self
    }

    pub fn auto_generate_message_id(mut self, enabled: bool) -> Self {
        self.options.auto_generate_message_id = Some(enabled);
        self
    }

    /// Envelope template; the body passed to `publish` replaces its body.
    pub fn publishing(mut self, publishing: Publishing) -> Self {
        self.options.publishing = Some(publishing);
        self
    }

    pub fn build(self) -> PublishOptions {
        self.options
    }
}

#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    pub consumer: ConsumerConfig,
    pub retry: MessageRetryConfig,
    pub queue: Option<QueueConfig>,
    pub binding: Option<QueueBindConfig>,
}

impl ConsumeOptions {
    pub fn builder() -> ConsumeOptionsBuilder {
        ConsumeOptionsBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct ConsumeOptionsBuilder {
    consumer: Option<ConsumerConfig>,
    retry: Option<MessageRetryConfig>,
    queue: Option<QueueConfig>,
    binding: Option<QueueBindConfig>,
}

impl ConsumeOptionsBuilder {
    pub fn consumer(mut self, consumer: ConsumerConfig) -> Self {
        self.consumer = Some(consumer);
        self
    }

    pub fn retry(mut self, retry: MessageRetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Queue to (re)declare on every consumer setup.
    pub fn queue(mut self, queue: QueueConfig) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn binding(mut self, binding: QueueBindConfig) -> Self {
        self.binding = Some(binding);
        self
    }

    pub fn build(self) -> Result<ConsumeOptions, ConfigError> {
        let consumer = self.consumer.ok_or(ConfigError::Missing("consumer"))?;
        consumer.validate()?;
        if let Some(queue) = &self.queue {
            queue.validate()?;
            if queue.name != consumer.queue {
                return Err(ConfigError::invalid(
                    "queue",
                    format!("declared {} but consuming {}", queue.name, consumer.queue),
                ));
            }
        }
        if let Some(binding) = &self.binding {
            binding.validate()?;
        }
        Ok(ConsumeOptions {
            consumer,
            retry: self.retry.unwrap_or_default(),
            queue: self.queue,
            binding: self.binding,
        })
    }
}
