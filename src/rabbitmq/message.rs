// src/rabbitmq/message.rs

use lapin::types::{AMQPValue, FieldTable};
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::errors::{RabbitMQError, Result};
use super::transport::Acknowledger;

pub const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";
pub const DEATH_HEADER: &str = "x-death";

/// Redelivery metadata the broker attached to a delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RedeliveryInfo {
    /// `x-delivery-count`, set by quorum queues.
    pub delivery_count: Option<i64>,
    /// `count` of the most recent `x-death` entry.
    pub latest_death_count: Option<i64>,
}

impl RedeliveryInfo {
    pub fn has_history(&self) -> bool {
        self.delivery_count.is_some() || self.latest_death_count.is_some()
    }

    pub fn exceeds(&self, limit: i64) -> bool {
        self.delivery_count.is_some_and(|count| count > limit)
            || self.latest_death_count.is_some_and(|count| count > limit)
    }
}

/// One inbound delivery. It must be settled exactly once: the first of
/// `ack`, `nack` or `reject` wins and later calls fail with
/// `AlreadyAcknowledged`.
pub struct Message {
    delivery_tag: u64,
    message_id: String,
    content_type: Option<String>,
    exchange: String,
    routing_key: String,
    redelivered: bool,
    headers: FieldTable,
    body: Vec<u8>,
    acker: Arc<dyn Acknowledger>,
    settled: AtomicBool,
}

pub struct MessageParts {
    pub delivery_tag: u64,
    pub message_id: Option<String>,
    pub content_type: Option<String>,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub headers: FieldTable,
    pub body: Vec<u8>,
}

impl Message {
    pub fn new(parts: MessageParts, acker: Arc<dyn Acknowledger>) -> Self {
        Self {
            delivery_tag: parts.delivery_tag,
            message_id: parts.message_id.unwrap_or_default(),
            content_type: parts.content_type,
            exchange: parts.exchange,
            routing_key: parts.routing_key,
            redelivered: parts.redelivered,
            headers: parts.headers,
            body: parts.body,
            acker,
            settled: AtomicBool::new(false),
        }
    }

    /// Message id, empty when the publisher did not set one.
    pub fn id(&self) -> &str {
        &self.message_id
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn headers(&self) -> &FieldTable {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&AMQPValue> {
        header(&self.headers, key)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    pub async fn ack(&self) -> Result<()> {
        self.settle()?;
        self.acker.ack(false).await
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.settle()?;
        self.acker.nack(false, requeue).await
    }

    pub async fn reject(&self, requeue: bool) -> Result<()> {
        self.settle()?;
        self.acker.reject(requeue).await
    }

    pub fn redelivery(&self) -> RedeliveryInfo {
        RedeliveryInfo {
            delivery_count: self.header(DELIVERY_COUNT_HEADER).and_then(amqp_int),
            latest_death_count: latest_death_count(&self.headers),
        }
    }

    fn settle(&self) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(RabbitMQError::AlreadyAcknowledged(self.label()));
        }
        Ok(())
    }

    fn label(&self) -> String {
        if self.message_id.is_empty() {
            format!("#{}", self.delivery_tag)
        } else {
            self.message_id.clone()
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("delivery_tag", &self.delivery_tag)
            .field("message_id", &self.message_id)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .field("settled", &self.is_settled())
            .finish()
    }
}

fn header<'a>(table: &'a FieldTable, key: &str) -> Option<&'a AMQPValue> {
    table
        .inner()
        .iter()
        .find(|(name, _)| name.as_str() == key)
        .map(|(_, value)| value)
}

/// Brokers and plugins encode counters with different integer widths.
fn amqp_int(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongLongInt(v) => Some(*v),
        _ => None,
    }
}

// RabbitMQ keeps the newest death event at the head of `x-death`.
fn latest_death_count(headers: &FieldTable) -> Option<i64> {
    let deaths = match header(headers, DEATH_HEADER)? {
        AMQPValue::FieldArray(deaths) => deaths,
        _ => return None,
    };
    match deaths.as_slice().first()? {
        AMQPValue::FieldTable(entry) => header(entry, "count").and_then(amqp_int),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rabbitmq::fake::{AckRecord, RecordingAcker};
    use lapin::types::{FieldArray, LongString, ShortString};

    fn death(count: i64) -> AMQPValue {
        let mut entry = FieldTable::default();
        entry.insert(ShortString::from("count"), AMQPValue::LongLongInt(count));
        entry.insert(
            ShortString::from("reason"),
            AMQPValue::LongString(LongString::from("rejected")),
        );
        AMQPValue::FieldTable(entry)
    }

    fn message_with(headers: FieldTable, acker: Arc<RecordingAcker>) -> Message {
        Message::new(
            MessageParts {
                delivery_tag: 1,
                message_id: Some("m-1".into()),
                content_type: None,
                exchange: "ex1".into(),
                routing_key: "k1".into(),
                redelivered: false,
                headers,
                body: b"{}".to_vec(),
            },
            acker,
        )
    }

    #[test]
    fn only_the_first_death_entry_counts() {
        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from(DEATH_HEADER),
            AMQPValue::FieldArray(FieldArray::from(vec![death(3), death(1)])),
        );
        let message = message_with(headers, RecordingAcker::new(1));

        let info = message.redelivery();
        assert_eq!(info.latest_death_count, Some(3));
        assert_eq!(info.delivery_count, None);
        assert!(info.exceeds(2));
        assert!(!info.exceeds(3));
    }

    #[test]
    fn delivery_count_accepts_any_integer_width() {
        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from(DELIVERY_COUNT_HEADER),
            AMQPValue::LongInt(4),
        );
        let message = message_with(headers, RecordingAcker::new(1));
        assert_eq!(message.redelivery().delivery_count, Some(4));
        assert!(message.redelivery().has_history());
    }

    #[test]
    fn missing_headers_mean_no_history() {
        let message = message_with(FieldTable::default(), RecordingAcker::new(1));
        assert!(!message.redelivery().has_history());
        assert!(!message.redelivery().exceeds(0));
    }

    #[tokio::test]
    async fn second_settle_is_refused() {
        let acker = RecordingAcker::new(9);
        let message = message_with(FieldTable::default(), acker.clone());

        message.nack(false).await.unwrap();
        let err = message.ack().await.unwrap_err();

        assert!(matches!(err, RabbitMQError::AlreadyAcknowledged(id) if id == "m-1"));
        assert_eq!(
            acker.records(),
            vec![AckRecord::Nack {
                tag: 9,
                requeue: false
            }]
        );
    }
}
