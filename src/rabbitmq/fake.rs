//! In-memory broker used by the unit tests.
//!
//! Records every operation in order, lets tests script dial failures and
//! publish confirmations, push deliveries into live consumers, and kill
//! connections or channels the way a broker restart would.

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::future::{self, FutureExt};
use futures::StreamExt;
use lapin::types::FieldTable;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::errors::{RabbitMQError, Result};
use super::message::{Message, MessageParts};
use super::options::ConsumerConfig;
use super::publishing::Publishing;
use super::topology::{ExchangeConfig, QueueBindConfig, QueueConfig};
use super::transport::{
    close_pair, Acknowledger, BrokerChannel, BrokerConnection, CloseNotifier, CloseSignal,
    Confirmation, DeliveryStream, Dialer, PendingConfirm, PublishFlags, ReturnedMessage,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Dial(String),
    OpenChannel { channel: u16 },
    Qos { channel: u16, count: u16, size: u32, global: bool },
    ExchangeDeclare { channel: u16, name: String },
    QueueDeclare { channel: u16, name: String },
    QueueBind { channel: u16, queue: String, exchange: String, key: String },
    Consume { channel: u16, queue: String, tag: String },
    ConfirmSelect { channel: u16 },
    Publish { channel: u16, exchange: String, routing_key: String, flags: PublishFlags, message_id: Option<String> },
    CloseChannel { channel: u16 },
    CloseConnection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckRecord {
    Ack { tag: u64 },
    Nack { tag: u64, requeue: bool },
    Reject { tag: u64, requeue: bool },
}

/// How the fake broker answers publishes on confirm-mode channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmBehavior {
    Ack,
    Nack,
    /// Never answers.
    Silent,
    /// Returns mandatory publishes as unroutable.
    ReturnMandatory,
}

struct Consumer {
    channel: u16,
    queue: String,
    sender: mpsc::UnboundedSender<Result<Message>>,
}

struct State {
    ops: Vec<Op>,
    acks: Arc<Mutex<Vec<AckRecord>>>,
    failing_dials: Option<usize>,
    failing_channel_opens: usize,
    failing_confirm_selects: usize,
    confirm: ConfirmBehavior,
    connections: Vec<Arc<FakeConnection>>,
    consumers: Vec<Consumer>,
    published: Vec<Publishing>,
}

struct Shared {
    state: Mutex<State>,
    next_channel: AtomicU16,
    next_tag: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn record(&self, op: Op) {
        self.lock().ops.push(op);
    }

    fn drop_consumers(&self, channel: u16) {
        self.lock().consumers.retain(|consumer| consumer.channel != channel);
    }
}

#[derive(Clone)]
pub struct FakeBroker {
    shared: Arc<Shared>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    ops: Vec::new(),
                    acks: Arc::new(Mutex::new(Vec::new())),
                    failing_dials: Some(0),
                    failing_channel_opens: 0,
                    failing_confirm_selects: 0,
                    confirm: ConfirmBehavior::Ack,
                    connections: Vec::new(),
                    consumers: Vec::new(),
                    published: Vec::new(),
                }),
                next_channel: AtomicU16::new(1),
                next_tag: AtomicU64::new(1),
            }),
        }
    }

    pub fn dialer(&self) -> Arc<dyn Dialer> {
        Arc::new(FakeDialer {
            shared: Arc::clone(&self.shared),
        })
    }

    /// The next `count` dials fail.
    pub fn fail_next_dials(&self, count: usize) {
        self.shared.lock().failing_dials = Some(count);
    }

    /// Every dial fails from now on.
    pub fn fail_all_dials(&self) {
        self.shared.lock().failing_dials = None;
    }

    /// The next `count` channel opens fail, on any connection.
    pub fn fail_next_channel_opens(&self, count: usize) {
        self.shared.lock().failing_channel_opens = count;
    }

    /// The next `count` `confirm_select` calls fail.
    pub fn fail_next_confirm_selects(&self, count: usize) {
        self.shared.lock().failing_confirm_selects = count;
    }

    pub fn set_confirm(&self, behavior: ConfirmBehavior) {
        self.shared.lock().confirm = behavior;
    }

    pub fn ops(&self) -> Vec<Op> {
        self.shared.lock().ops.clone()
    }

    pub fn dialed(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::Dial(uri) => Some(uri),
                _ => None,
            })
            .collect()
    }

    pub fn acks(&self) -> Vec<AckRecord> {
        self.shared.lock().acks.lock().unwrap().clone()
    }

    pub fn published(&self) -> Vec<Publishing> {
        self.shared.lock().published.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.lock().connections.len()
    }

    /// Drops the most recent connection as a broker restart would.
    pub fn kill_connection(&self, reason: &str) {
        let connection = self.shared.lock().connections.last().cloned();
        if let Some(connection) = connection {
            connection.shutdown(reason);
        }
    }

    /// Closes a single channel from the broker side.
    pub fn kill_channel(&self, channel: u16, reason: &str) {
        let connections = self.shared.lock().connections.clone();
        for connection in connections {
            connection.kill_channel(channel, reason);
        }
    }

    /// Hands a delivery to the first live consumer of `queue`. Returns the
    /// delivery tag, or `None` when nobody consumes the queue.
    pub fn deliver(&self, queue: &str, message_id: &str, headers: FieldTable) -> Option<u64> {
        let tag = self.shared.next_tag.fetch_add(1, Ordering::SeqCst);
        let state = self.shared.lock();
        let consumer = state
            .consumers
            .iter()
            .find(|consumer| consumer.queue == queue && !consumer.sender.is_closed())?;
        let acker = Arc::new(RecordingAcker {
            tag,
            log: Arc::clone(&state.acks),
        });
        let message = Message::new(
            MessageParts {
                delivery_tag: tag,
                message_id: Some(message_id.to_string()),
                content_type: None,
                exchange: String::new(),
                routing_key: queue.to_string(),
                redelivered: false,
                headers,
                body: b"{}".to_vec(),
            },
            acker,
        );
        consumer.sender.unbounded_send(Ok(message)).ok()?;
        Some(tag)
    }
}

fn take_failure(remaining: &mut usize) -> bool {
    if *remaining == 0 {
        return false;
    }
    *remaining -= 1;
    true
}

struct FakeDialer {
    shared: Arc<Shared>,
}

#[async_trait]
impl Dialer for FakeDialer {
    async fn dial(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>> {
        let mut state = self.shared.lock();
        state.ops.push(Op::Dial(uri.to_string()));
        match state.failing_dials.as_mut() {
            None => return Err(RabbitMQError::ConnectionError("connection refused".into())),
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                return Err(RabbitMQError::ConnectionError("connection refused".into()));
            }
            Some(_) => {}
        }
        let (notifier, signal) = close_pair();
        let connection = Arc::new(FakeConnection {
            shared: Arc::clone(&self.shared),
            notifier,
            signal,
            channels: Mutex::new(Vec::new()),
        });
        state.connections.push(Arc::clone(&connection));
        Ok(connection)
    }
}

pub struct FakeConnection {
    shared: Arc<Shared>,
    notifier: CloseNotifier,
    signal: CloseSignal,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
}

impl FakeConnection {
    fn shutdown(&self, reason: &str) {
        self.notifier.notify(reason);
        let channels = std::mem::take(&mut *self.channels.lock().unwrap());
        for channel in channels {
            channel.shutdown(reason);
        }
    }

    fn kill_channel(&self, id: u16, reason: &str) {
        let mut channels = self.channels.lock().unwrap();
        if let Some(index) = channels.iter().position(|channel| channel.id == id) {
            channels.remove(index).shutdown(reason);
        }
    }
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        if self.notifier.is_closed() {
            return Err(RabbitMQError::ChannelError("connection closed".into()));
        }
        if take_failure(&mut self.shared.lock().failing_channel_opens) {
            return Err(RabbitMQError::ChannelError("channel open refused".into()));
        }
        let id = self.shared.next_channel.fetch_add(1, Ordering::SeqCst);
        self.shared.record(Op::OpenChannel { channel: id });
        let (notifier, signal) = close_pair();
        let channel = Arc::new(FakeChannel {
            id,
            shared: Arc::clone(&self.shared),
            notifier,
            signal,
            confirm_mode: Mutex::new(false),
        });
        self.channels.lock().unwrap().push(Arc::clone(&channel));
        Ok(channel)
    }

    fn close_signal(&self) -> CloseSignal {
        self.signal.clone()
    }

    fn is_connected(&self) -> bool {
        !self.notifier.is_closed()
    }

    async fn close(&self, reason: &str) -> Result<()> {
        self.shared.record(Op::CloseConnection);
        self.shutdown(reason);
        Ok(())
    }
}

pub struct FakeChannel {
    id: u16,
    shared: Arc<Shared>,
    notifier: CloseNotifier,
    signal: CloseSignal,
    confirm_mode: Mutex<bool>,
}

impl FakeChannel {
    fn shutdown(&self, reason: &str) {
        self.notifier.notify(reason);
        self.shared.drop_consumers(self.id);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.notifier.is_closed() {
            return Err(RabbitMQError::ChannelError(format!("channel {} is closed", self.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    fn id(&self) -> u16 {
        self.id
    }

    async fn qos(&self, prefetch_count: u16, prefetch_size: u32, global: bool) -> Result<()> {
        self.ensure_open()?;
        self.shared.record(Op::Qos {
            channel: self.id,
            count: prefetch_count,
            size: prefetch_size,
            global,
        });
        Ok(())
    }

    async fn exchange_declare(&self, config: &ExchangeConfig) -> Result<()> {
        self.ensure_open()?;
        self.shared.record(Op::ExchangeDeclare {
            channel: self.id,
            name: config.name.clone(),
        });
        Ok(())
    }

    async fn queue_declare(&self, config: &QueueConfig) -> Result<String> {
        self.ensure_open()?;
        self.shared.record(Op::QueueDeclare {
            channel: self.id,
            name: config.name.clone(),
        });
        Ok(config.name.clone())
    }

    async fn queue_bind(&self, config: &QueueBindConfig) -> Result<()> {
        self.ensure_open()?;
        self.shared.record(Op::QueueBind {
            channel: self.id,
            queue: config.queue.clone(),
            exchange: config.exchange.clone(),
            key: config.binding_key.clone(),
        });
        Ok(())
    }

    async fn consume(&self, config: &ConsumerConfig) -> Result<DeliveryStream> {
        self.ensure_open()?;
        let (sender, receiver) = mpsc::unbounded();
        let mut state = self.shared.lock();
        state.ops.push(Op::Consume {
            channel: self.id,
            queue: config.queue.clone(),
            tag: config.name.clone(),
        });
        state.consumers.push(Consumer {
            channel: self.id,
            queue: config.queue.clone(),
            sender,
        });
        Ok(receiver.boxed())
    }

    async fn confirm_select(&self) -> Result<()> {
        self.ensure_open()?;
        if take_failure(&mut self.shared.lock().failing_confirm_selects) {
            return Err(RabbitMQError::ChannelError("confirm.select refused".into()));
        }
        *self.confirm_mode.lock().unwrap() = true;
        self.shared.record(Op::ConfirmSelect { channel: self.id });
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        flags: PublishFlags,
        publishing: &Publishing,
    ) -> Result<PendingConfirm> {
        self.ensure_open()?;
        let behavior = {
            let mut state = self.shared.lock();
            state.ops.push(Op::Publish {
                channel: self.id,
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                flags,
                message_id: publishing.message_id.clone(),
            });
            state.published.push(publishing.clone());
            state.confirm
        };
        if !*self.confirm_mode.lock().unwrap() {
            return Ok(future::ready(Ok(Confirmation::NotRequested)).boxed());
        }
        let confirmation = match behavior {
            ConfirmBehavior::Ack => Confirmation::Ack,
            ConfirmBehavior::Nack => Confirmation::Nack,
            ConfirmBehavior::Silent => {
                return Ok(future::pending::<Result<Confirmation>>().boxed())
            }
            ConfirmBehavior::ReturnMandatory if flags.mandatory => {
                Confirmation::Returned(ReturnedMessage {
                    reply_code: 312,
                    reply_text: "NO_ROUTE".into(),
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    message_id: publishing.message_id.clone(),
                    body: publishing.body.clone(),
                })
            }
            ConfirmBehavior::ReturnMandatory => Confirmation::Ack,
        };
        Ok(future::ready(Ok(confirmation)).boxed())
    }

    fn close_signal(&self) -> CloseSignal {
        self.signal.clone()
    }

    fn is_open(&self) -> bool {
        !self.notifier.is_closed()
    }

    async fn close(&self, reason: &str) -> Result<()> {
        self.shared.record(Op::CloseChannel { channel: self.id });
        self.shutdown(reason);
        Ok(())
    }
}

/// Acknowledger that only records what it was asked to do.
pub struct RecordingAcker {
    tag: u64,
    log: Arc<Mutex<Vec<AckRecord>>>,
}

impl RecordingAcker {
    pub fn new(tag: u64) -> Arc<Self> {
        Arc::new(Self {
            tag,
            log: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn records(&self) -> Vec<AckRecord> {
        self.log.lock().unwrap().clone()
    }

    fn push(&self, record: AckRecord) {
        self.log.lock().unwrap().push(record);
    }
}

#[async_trait]
impl Acknowledger for RecordingAcker {
    async fn ack(&self, _multiple: bool) -> Result<()> {
        self.push(AckRecord::Ack { tag: self.tag });
        Ok(())
    }

    async fn nack(&self, _multiple: bool, requeue: bool) -> Result<()> {
        self.push(AckRecord::Nack {
            tag: self.tag,
            requeue,
        });
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.push(AckRecord::Reject {
            tag: self.tag,
            requeue,
        });
        Ok(())
    }
}

/// A bare message for tests that do not go through a consumer.
pub fn message(id: &str, headers: FieldTable, acker: Arc<RecordingAcker>) -> Message {
    let tag = acker.tag;
    Message::new(
        MessageParts {
            delivery_tag: tag,
            message_id: Some(id.to_string()),
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
