// src/rabbitmq/amqp_client.rs
//
// lapin implementation of the transport traits.

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use lapin::acker::Acker;
use lapin::message::{BasicReturnMessage, Delivery};
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation as LapinConfirmation;
use lapin::types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind as LapinExchangeKind};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn, Span};

use super::connection_pool::redact_uri;
use super::errors::{RabbitMQError, Result};
use super::message::{Message, MessageParts};
use super::options::ConsumerConfig;
use super::publishing::Publishing;
use super::topology::{Arguments, ExchangeConfig, ExchangeKind, QueueBindConfig, QueueConfig};
use super::transport::{
    close_pair, Acknowledger, BrokerChannel, BrokerConnection, CloseNotifier, CloseSignal,
    Confirmation, DeliveryStream, Dialer, PendingConfirm, PublishFlags, ReturnedMessage,
};

const REPLY_SUCCESS: u16 = 200;

pub struct LapinDialer {
    connection_name: String,
    connect_timeout: Duration,
    span: Span,
}

impl LapinDialer {
    pub fn new(connection_name: impl Into<String>, connect_timeout: Duration, span: Span) -> Self {
        Self {
            connection_name: connection_name.into(),
            connect_timeout,
            span,
        }
    }
}

#[async_trait]
impl Dialer for LapinDialer {
    async fn dial(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>> {
        let properties = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let connection = timeout(self.connect_timeout, Connection::connect(uri, properties))
            .await?
            .map_err(|e| RabbitMQError::ConnectionError(e.to_string()))?;

        let (notifier, signal) = close_pair();
        let on_error = notifier.clone();
        let span = self.span.clone();
        connection.on_error(move |err| {
            warn!(parent: &span, error = %err, "connection error");
            on_error.notify(err.to_string());
        });

        debug!(parent: &self.span, uri = %redact_uri(uri), "connection established");
        Ok(Arc::new(LapinConnection {
            connection,
            notifier,
            signal,
            span: self.span.clone(),
        }))
    }
}

pub struct LapinConnection {
    connection: Connection,
    notifier: CloseNotifier,
    signal: CloseSignal,
    span: Span,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| RabbitMQError::ChannelError(e.to_string()))?;

        let (notifier, signal) = close_pair();
        let on_error = notifier.clone();
        let span = self.span.clone();
        let id = channel.id();
        channel.on_error(move |err| {
            warn!(parent: &span, channel = id, error = %err, "channel error");
            on_error.notify(err.to_string());
        });

        Ok(Arc::new(LapinChannel {
            channel,
            notifier,
            signal,
            span: self.span.clone(),
        }))
    }

    fn close_signal(&self) -> CloseSignal {
        self.signal.clone()
    }

    fn is_connected(&self) -> bool {
        !self.notifier.is_closed() && self.connection.status().connected()
    }

    async fn close(&self, reason: &str) -> Result<()> {
        let result = self
            .connection
            .close(REPLY_SUCCESS, reason)
            .await
            .map_err(|e| RabbitMQError::ConnectionError(e.to_string()));
        self.notifier.notify(reason);
        result
    }
}

pub struct LapinChannel {
    channel: Channel,
    notifier: CloseNotifier,
    signal: CloseSignal,
    span: Span,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn id(&self) -> u16 {
        self.channel.id()
    }

    async fn qos(&self, prefetch_count: u16, prefetch_size: u32, global: bool) -> Result<()> {
        if prefetch_size != 0 {
            warn!(parent: &self.span, prefetch_size, "prefetch size is not supported and is ignored");
        }
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global })
            .await
            .map_err(|e| RabbitMQError::ChannelError(e.to_string()))
    }

    async fn exchange_declare(&self, config: &ExchangeConfig) -> Result<()> {
        let options = ExchangeDeclareOptions {
            passive: false,
            durable: config.durable,
            auto_delete: config.auto_delete,
            internal: config.internal,
            nowait: config.no_wait,
        };
        self.channel
            .exchange_declare(
                &config.name,
                exchange_kind(config.kind),
                options,
                field_table(&config.args),
            )
            .await
            .map_err(|e| RabbitMQError::DeclareError(format!("exchange {}: {}", config.name, e)))
    }

    async fn queue_declare(&self, config: &QueueConfig) -> Result<String> {
        let options = QueueDeclareOptions {
            passive: false,
            durable: config.durable,
            exclusive: config.exclusive,
            auto_delete: config.auto_delete,
            nowait: config.no_wait,
        };
        let queue = self
            .channel
            .queue_declare(&config.name, options, field_table(&config.args))
            .await
            .map_err(|e| RabbitMQError::DeclareError(format!("queue {}: {}", config.name, e)))?;
        Ok(queue.name().as_str().to_string())
    }

    async fn queue_bind(&self, config: &QueueBindConfig) -> Result<()> {
        self.channel
            .queue_bind(
                &config.queue,
                &config.exchange,
                &config.binding_key,
                QueueBindOptions {
                    nowait: config.no_wait,
                },
                field_table(&config.args),
            )
            .await
            .map_err(|e| {
                RabbitMQError::DeclareError(format!(
                    "bind {} to {}: {}",
                    config.queue, config.exchange, e
                ))
            })
    }

    async fn consume(&self, config: &ConsumerConfig) -> Result<DeliveryStream> {
        // Acknowledgment is always explicit; auto-ack is done by the worker.
        let options = BasicConsumeOptions {
            no_local: config.no_local,
            no_ack: false,
            exclusive: config.exclusive,
            nowait: config.no_wait,
        };
        let consumer = self
            .channel
            .basic_consume(&config.queue, &config.name, options, field_table(&config.args))
            .await
            .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))?;

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(into_message)
                    .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))
            })
            .boxed())
    }

    async fn confirm_select(&self) -> Result<()> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| RabbitMQError::ChannelError(e.to_string()))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        flags: PublishFlags,
        publishing: &Publishing,
    ) -> Result<PendingConfirm> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: flags.mandatory,
                    immediate: flags.immediate,
                },
                &publishing.body,
                properties(publishing),
            )
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?;

        Ok(async move {
            confirm
                .await
                .map(into_confirmation)
                .map_err(|e| RabbitMQError::PublishError(e.to_string()))
        }
        .boxed())
    }

    fn close_signal(&self) -> CloseSignal {
        self.signal.clone()
    }

    fn is_open(&self) -> bool {
        !self.notifier.is_closed() && self.channel.status().connected()
    }

    async fn close(&self, reason: &str) -> Result<()> {
        let result = self
            .channel
            .close(REPLY_SUCCESS, reason)
            .await
            .map_err(|e| RabbitMQError::ChannelError(e.to_string()));
        self.notifier.notify(reason);
        result
    }
}

pub struct LapinAcker(Acker);

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self, multiple: bool) -> Result<()> {
        self.0
            .ack(BasicAckOptions { multiple })
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    async fn nack(&self, multiple: bool, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions { multiple, requeue })
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }
}

fn into_message(delivery: Delivery) -> Message {
    let Delivery {
        delivery_tag,
        exchange,
        routing_key,
        redelivered,
        properties,
        data,
        acker,
        ..
    } = delivery;

    Message::new(
        MessageParts {
            delivery_tag,
            message_id: properties.message_id().as_ref().map(|id| id.to_string()),
            content_type: properties.content_type().as_ref().map(|ct| ct.to_string()),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            redelivered,
            headers: properties.headers().clone().unwrap_or_default(),
            body: data,
        },
        Arc::new(LapinAcker(acker)),
    )
}

fn into_confirmation(confirmation: LapinConfirmation) -> Confirmation {
    match confirmation {
        LapinConfirmation::Ack(Some(returned)) => Confirmation::Returned(returned_message(*returned)),
        LapinConfirmation::Ack(None) => Confirmation::Ack,
        LapinConfirmation::Nack(_) => Confirmation::Nack,
        LapinConfirmation::NotRequested => Confirmation::NotRequested,
    }
}

fn returned_message(returned: BasicReturnMessage) -> ReturnedMessage {
    let BasicReturnMessage {
        delivery,
        reply_code,
        reply_text,
        ..
    } = returned;
    ReturnedMessage {
        reply_code,
        reply_text: reply_text.to_string(),
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        message_id: delivery
            .properties
            .message_id()
            .as_ref()
            .map(|id| id.to_string()),
        body: delivery.data,
    }
}

fn properties(publishing: &Publishing) -> BasicProperties {
    let mut properties = BasicProperties::default()
        .with_content_type(ShortString::from(publishing.content_type.clone()))
        .with_delivery_mode(publishing.delivery_mode.as_amqp())
        .with_headers(publishing.headers.clone());
    if let Some(timestamp) = publishing.timestamp {
        properties = properties.with_timestamp(u64::try_from(timestamp.timestamp()).unwrap_or_default());
    }
    if let Some(id) = publishing.id() {
        properties = properties.with_message_id(ShortString::from(id.to_string()));
    }
    properties
}

fn exchange_kind(kind: ExchangeKind) -> LapinExchangeKind {
    match kind {
        ExchangeKind::Direct => LapinExchangeKind::Direct,
        ExchangeKind::Topic => LapinExchangeKind::Topic,
        ExchangeKind::Fanout => LapinExchangeKind::Fanout,
        ExchangeKind::Headers => LapinExchangeKind::Headers,
    }
}

/// Converts JSON config arguments into an AMQP field table.
pub fn field_table(args: &Arguments) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in args {
        table.insert(ShortString::from(key.clone()), amqp_value(value));
    }
    table
}

fn amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => AMQPValue::LongLongInt(i),
            None => AMQPValue::Double(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => AMQPValue::LongString(LongString::from(s.clone())),
        Value::Array(items) => {
            AMQPValue::FieldArray(FieldArray::from(items.iter().map(amqp_value).collect::<Vec<_>>()))
        }
        Value::Object(map) => {
            let mut table = FieldTable::default();
            for (key, value) in map {
                table.insert(ShortString::from(key.clone()), amqp_value(value));
            }
            AMQPValue::FieldTable(table)
        }
    }
}
