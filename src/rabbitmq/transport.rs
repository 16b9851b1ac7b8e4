//! Capability traits the client core is written against.
//!
//! `amqp_client` implements them on top of lapin. Everything above this seam
//! (pool, connection manager, channel monitors, publisher, consumer) only
//! sees these traits, so the reconnect and retry state machines can be
//! driven without a broker.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use std::sync::Arc;
use tokio::sync::watch;

use super::errors::Result;
use super::message::Message;
use super::options::ConsumerConfig;
use super::publishing::Publishing;
use super::topology::{ExchangeConfig, QueueBindConfig, QueueConfig};

/// Inbound deliveries of one `basic.consume`. Ends when the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Message>>;

/// Resolves once the broker has answered a publish (or immediately when the
/// channel is not in confirm mode).
pub type PendingConfirm = BoxFuture<'static, Result<Confirmation>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack,
    /// Broker accepted the publish but could not route it (mandatory flag).
    Returned(ReturnedMessage),
    NotRequested,
}

/// An unroutable message handed back by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnedMessage {
    pub reply_code: u16,
    pub reply_text: String,
    pub exchange: String,
    pub routing_key: String,
    pub message_id: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishFlags {
    pub mandatory: bool,
    pub immediate: bool,
}

/// Sending half of a close notification. Only the first reason is kept.
#[derive(Debug, Clone)]
pub struct CloseNotifier(Arc<watch::Sender<Option<String>>>);

/// Receiving half of a close notification; cheap to clone, every clone
/// observes the same close.
#[derive(Debug, Clone)]
pub struct CloseSignal(watch::Receiver<Option<String>>);

pub fn close_pair() -> (CloseNotifier, CloseSignal) {
    let (tx, rx) = watch::channel(None);
    (CloseNotifier(Arc::new(tx)), CloseSignal(rx))
}

impl CloseNotifier {
    pub fn notify(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.0.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }

    pub fn is_closed(&self) -> bool {
        self.0.borrow().is_some()
    }
}

impl CloseSignal {
    /// Waits until the owner reports a close and returns its reason.
    pub async fn closed(&mut self) -> String {
        loop {
            let current = self.0.borrow_and_update().clone();
            if let Some(reason) = current {
                return reason;
            }
            if self.0.changed().await.is_err() {
                return "close notifier dropped".to_string();
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.0.borrow().is_some()
    }
}

/// Dials a broker endpoint.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    /// Fires on broker-initiated or network-level closure, and after `close`.
    fn close_signal(&self) -> CloseSignal;

    fn is_connected(&self) -> bool;

    async fn close(&self, reason: &str) -> Result<()>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn id(&self) -> u16;

    async fn qos(&self, prefetch_count: u16, prefetch_size: u32, global: bool) -> Result<()>;

    async fn exchange_declare(&self, config: &ExchangeConfig) -> Result<()>;

    /// Returns the declared queue name.
    async fn queue_declare(&self, config: &QueueConfig) -> Result<String>;

    async fn queue_bind(&self, config: &QueueBindConfig) -> Result<()>;

    async fn consume(&self, config: &ConsumerConfig) -> Result<DeliveryStream>;

    async fn confirm_select(&self) -> Result<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        flags: PublishFlags,
        publishing: &Publishing,
    ) -> Result<PendingConfirm>;

    fn close_signal(&self) -> CloseSignal;

    fn is_open(&self) -> bool;

    async fn close(&self, reason: &str) -> Result<()>;
}

/// Settles one delivery on the channel it arrived on.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, multiple: bool) -> Result<()>;

    async fn nack(&self, multiple: bool, requeue: bool) -> Result<()>;

    async fn reject(&self, requeue: bool) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn close_signal_keeps_the_first_reason() {
        let (notifier, mut signal) = close_pair();
        let mut other = signal.clone();
        assert!(!signal.is_closed());

        notifier.notify("broker restart");
        notifier.notify("second close");

        assert_eq!(signal.closed().await, "broker restart");
        assert_eq!(other.closed().await, "broker restart");
        assert!(notifier.is_closed());
    }

    #[tokio::test]
    async fn dropped_notifier_counts_as_closed() {
        let (notifier, mut signal) = close_pair();
        drop(notifier);
        assert_eq!(signal.closed().await, "close notifier dropped");
    }
}
