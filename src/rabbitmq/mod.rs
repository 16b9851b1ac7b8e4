// src/rabbitmq/mod.rs
// Resilient RabbitMQ client: pooled endpoints, reconnects, confirmed
// publishing and retry-aware consumption.

pub mod errors;
pub mod transport;

pub mod amqp_client;
pub mod channel_manager;
pub mod connection;
pub mod connection_pool;
pub mod consumer;
pub mod event_handler;
pub mod manager;
pub mod message;
pub mod options;
pub mod publisher;
pub mod publishing;
pub mod topology;

#[cfg(test)]
pub(crate) mod fake;

// Re-export specific items to simplify imports elsewhere
pub use connection::{ConnectionEvent, ConnectionState};
pub use errors::{ConfigError, ErrorKind, RabbitMQError, Result};
pub use event_handler::{DeadLetterCause, MessageHandler, Outcome};
pub use manager::QueueManager;
pub use message::{Message, RedeliveryInfo};
pub use options::{
    ConsumeOptions, ConsumerConfig, MessageRetryConfig, PublishOptions, PublisherConfig,
    QueueManagerConfig, ReconnectConfig,
};
pub use publishing::{DeliveryMode, Publishing};
pub use topology::{Exchange, ExchangeConfig, ExchangeKind, Queue, QueueBindConfig, QueueConfig};
pub use transport::ReturnedMessage;
