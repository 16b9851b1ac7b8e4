// src/rabbitmq/errors.rs

use serde_json::Error as SerdeError;
use std::time::Duration;
use thiserror::Error;
use tokio::time::error::Elapsed;

/// Problems with the supplied configuration. Detected before any network
/// call and never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("queue manager is disabled")]
    Disabled,

    #[error("missing or invalid {0} configuration")]
    Missing(&'static str),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RabbitMQError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("failed to connect to RabbitMQ after {attempts} attempts: {last_error}")]
    ReconnectExhausted { attempts: u32, last_error: String },

    #[error("connection is not open")]
    NotConnected,

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("RabbitMQ declare error: {0}")]
    DeclareError(String),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("message {message_id} was rejected by the broker")]
    PublishRejected { message_id: String },

    #[error("message {message_id} was not confirmed within {timeout:?}")]
    ConfirmTimeout { message_id: String, timeout: Duration },

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("message {0} has already been acknowledged")]
    AlreadyAcknowledged(String),

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),

    #[error("Connection timeout: {0}")]
    TimeoutError(String),
}

/// Coarse classification used for logging and by callers deciding whether
/// an operation is worth resubmitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Connectivity,
    Topology,
    Publish,
    Acknowledgement,
    Serialization,
}

impl RabbitMQError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RabbitMQError::Config(_) => ErrorKind::Configuration,
            RabbitMQError::ConnectionError(_)
            | RabbitMQError::ReconnectExhausted { .. }
            | RabbitMQError::NotConnected
            | RabbitMQError::ChannelError(_)
            | RabbitMQError::ConsumeError(_)
            | RabbitMQError::TimeoutError(_) => ErrorKind::Connectivity,
            RabbitMQError::DeclareError(_) => ErrorKind::Topology,
            RabbitMQError::PublishError(_)
            | RabbitMQError::PublishRejected { .. }
            | RabbitMQError::ConfirmTimeout { .. } => ErrorKind::Publish,
            RabbitMQError::AckError(_) | RabbitMQError::AlreadyAcknowledged(_) => {
                ErrorKind::Acknowledgement
            }
            RabbitMQError::SerializationError(_) => ErrorKind::Serialization,
        }
    }

    pub fn is_config(&self) -> bool {
        self.kind() == ErrorKind::Configuration
    }
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl From<Elapsed> for RabbitMQError {
    fn from(_: Elapsed) -> Self {
        RabbitMQError::TimeoutError("Connection timed out".to_string())
    }
}
