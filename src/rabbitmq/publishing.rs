use chrono::{DateTime, Utc};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use serde::Serialize;

use super::errors::Result;

pub const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    #[default]
    Transient,
    Persistent,
}

impl DeliveryMode {
    /// AMQP `delivery-mode` property value.
    pub fn as_amqp(self) -> u8 {
        match self {
            DeliveryMode::Transient => 1,
            DeliveryMode::Persistent => 2,
        }
    }
}

/// An outbound message. Exchange and routing key are chosen at publish time.
#[derive(Debug, Clone, PartialEq)]
pub struct Publishing {
    pub content_type: String,
    pub delivery_mode: DeliveryMode,
    pub timestamp: Option<DateTime<Utc>>,
    pub message_id: Option<String>,
    pub headers: FieldTable,
    pub body: Vec<u8>,
}

impl Default for Publishing {
    fn default() -> Self {
        Self {
            content_type: JSON_CONTENT_TYPE.to_string(),
            delivery_mode: DeliveryMode::Transient,
            timestamp: Some(Utc::now()),
            message_id: None,
            headers: FieldTable::default(),
            body: Vec::new(),
        }
    }
}

impl Publishing {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn json<T: Serialize>(payload: &T) -> Result<Self> {
        Ok(Self::new(serde_json::to_vec(payload)?))
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    pub fn persistent(self) -> Self {
        self.with_delivery_mode(DeliveryMode::Persistent)
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: Option<DateTime<Utc>>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(
            ShortString::from(key),
            AMQPValue::LongString(LongString::from(value)),
        );
        self
    }

    pub fn with_headers(mut self, headers: FieldTable) -> Self {
        self.headers = headers;
        self
    }

    /// Message id when one is set and non-empty.
    pub fn id(&self) -> Option<&str> {
        self.message_id.as_deref().filter(|id| !id.is_empty())
    }
}
