// src/rabbitmq/manager.rs

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use super::amqp_client::LapinDialer;
use super::channel_manager::ChannelManager;
use super::connection::{ConnectionEvent, ConnectionManager, ConnectionState};
use super::connection_pool::ConnectionPool;
use super::consumer::Consumer;
use super::errors::{ConfigError, RabbitMQError, Result};
use super::event_handler::{DeliveryProcessor, MessageHandler, RetryPolicy};
use super::options::{ConsumeOptions, PublishOptions, PublisherConfig, QueueManagerConfig, ReconnectConfig};
use super::publisher::Publisher;
use super::topology::{Exchange, ExchangeConfig, Queue, QueueBindConfig, QueueConfig, RmqExchange, RmqQueue};
use super::transport::{BrokerChannel, Dialer, ReturnedMessage};

/// Entry point: one connection, at most one publisher channel and one
/// consumer channel, rebuilt automatically after reconnects.
pub struct QueueManager {
    inner: Arc<Inner>,
    supervisor: Option<JoinHandle<()>>,
    reconnect_handler: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone, Copy)]
enum Role {
    Publisher,
    Consumer,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Role::Publisher => "publisher",
            Role::Consumer => "consumer",
        }
    }
}

struct Inner {
    connection: Arc<ConnectionManager>,
    reconnect: ReconnectConfig,
    publisher_channel: Option<ChannelManager>,
    consumer_channel: Option<ChannelManager>,
    publisher: RwLock<Option<Arc<Publisher>>>,
    consumer: Mutex<Option<Arc<Consumer>>>,
    declared_queues: Mutex<HashMap<String, (QueueConfig, QueueBindConfig)>>,
    returns_tx: mpsc::UnboundedSender<ReturnedMessage>,
    returns_rx: Mutex<Option<mpsc::UnboundedReceiver<ReturnedMessage>>>,
    span: Span,
}

impl QueueManager {
    pub async fn new(config: QueueManagerConfig) -> Result<Self> {
        config.validate()?;
        let span = info_span!("rmq", connection = %config.connection_name);
        let dialer = LapinDialer::new(
            config.connection_name.clone(),
            config.connect_timeout(),
            span.clone(),
        );
        Self::with_dialer(config, Arc::new(dialer), span).await
    }

    pub async fn with_dialer(config: QueueManagerConfig, dialer: Arc<dyn Dialer>, span: Span) -> Result<Self> {
        config.validate()?;

        let pool = ConnectionPool::new(config.conn_uris.clone(), dialer, span.clone())?;
        let connection = Arc::new(ConnectionManager::new(pool, config.reconnect, span.clone()));
        connection.connect().await?;

        let publisher_channel = if config.enable_publisher {
            let channels = ChannelManager::new("publisher", Arc::clone(&connection), span.clone());
            channels.open().await?;
            Some(channels)
        } else {
            None
        };
        let consumer_channel = if config.enable_consumer {
            let channels = ChannelManager::new("consumer", Arc::clone(&connection), span.clone());
            channels.open().await?;
            Some(channels)
        } else {
            None
        };

        let (returns_tx, returns_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            connection: Arc::clone(&connection),
            reconnect: config.reconnect,
            publisher_channel,
            consumer_channel,
            publisher: RwLock::new(None),
            consumer: Mutex::new(None),
            declared_queues: Mutex::new(HashMap::new()),
            returns_tx,
            returns_rx: Mutex::new(Some(returns_rx)),
            span: span.clone(),
        });

        let (supervisor, reconnect_handler) = if config.auto_reconnect {
            let events = connection.subscribe();
            let handler = tokio::spawn(Arc::clone(&inner).handle_reconnects(events).instrument(span.clone()));
            (Some(connection.spawn_supervisor()), Some(handler))
        } else {
            (None, None)
        };

        info!(
            parent: &span,
            publisher = config.enable_publisher,
            consumer = config.enable_consumer,
            auto_reconnect = config.auto_reconnect,
            "queue manager ready"
        );
        Ok(Self {
            inner,
            supervisor,
            reconnect_handler,
        })
    }

    pub async fn create_exchange(&self, config: ExchangeConfig) -> Result<Arc<dyn Exchange>> {
        config.validate()?;
        let exchange = Arc::new(RmqExchange::new(config, self.inner.span.clone()));
        let (channel, temporary) = self.inner.topology_channel(self.inner.publisher_channel.as_ref()).await?;
        let declared = exchange.declare(channel.as_ref()).await;
        Inner::release(channel, temporary).await;
        declared?;
        Ok(exchange)
    }

    /// Declares `queue` and binds it. The declaration is remembered so a later
    /// `consume` on the same queue re-applies it after reconnects.
    pub async fn create_and_bind_queue(&self, queue: QueueConfig, binding: QueueBindConfig) -> Result<Arc<dyn Queue>> {
        queue.validate()?;
        binding.validate()?;
        if binding.queue != queue.name {
            return Err(ConfigError::invalid(
                "queue bind",
                format!("binding targets {} but declaring {}", binding.queue, queue.name),
            )
            .into());
        }

        let declared = Arc::new(RmqQueue::new(queue.clone(), self.inner.span.clone()));
        let (channel, temporary) = self.inner.topology_channel(self.inner.consumer_channel.as_ref()).await?;
        let result = async {
            declared.declare(channel.as_ref()).await?;
            declared.bind(channel.as_ref(), &binding).await
        }
        .await;
        Inner::release(channel, temporary).await;
        result?;

        self.inner
            .declared_queues
            .lock()
            .await
            .insert(queue.name.clone(), (queue, binding));
        Ok(declared)
    }

    pub async fn create_publisher(&self, exchange: Arc<dyn Exchange>, config: PublisherConfig) -> Result<()> {
        let channels = self
            .inner
            .publisher_channel
            .as_ref()
            .ok_or_else(|| ConfigError::invalid("publisher", "publisher is disabled"))?;
        let channel = channels.current().await.ok_or(RabbitMQError::NotConnected)?;

        let publisher = Arc::new(Publisher::new(
            exchange.name(),
            config,
            self.inner.returns_tx.clone(),
            self.inner.span.clone(),
        ));
        publisher.attach(channel).await?;
        *self.inner.publisher.write().await = Some(publisher);
        Ok(())
    }

    /// Publishes `body` and returns the message id it went out with.
    pub async fn publish(&self, body: Vec<u8>, options: PublishOptions) -> Result<String> {
        let publisher = self
            .inner
            .publisher
            .read()
            .await
            .clone()
            .ok_or(ConfigError::Missing("publisher"))?;
        publisher.send(body, options).await
    }

    pub async fn consume(&self, handler: Arc<dyn MessageHandler>, options: ConsumeOptions) -> Result<()> {
        let channels = self
            .inner
            .consumer_channel
            .as_ref()
            .ok_or_else(|| ConfigError::invalid("consumer", "consumer is disabled"))?;

        let mut slot = self.inner.consumer.lock().await;
        if slot.is_some() {
            return Err(ConfigError::invalid("consumer", "a consumer is already running").into());
        }

        let ConsumeOptions {
            consumer,
            retry,
            queue,
            binding,
        } = options;
        let remembered = self.inner.declared_queues.lock().await.get(&consumer.queue).cloned();
        let (queue, binding) = match (queue, binding, remembered) {
            (None, None, Some((queue, binding))) => (Some(queue), Some(binding)),
            (queue, binding, _) => (queue, binding),
        };

        let dead_letter_path = queue
            .as_ref()
            .is_some_and(|queue| queue.dead_letter_exchange().is_some());
        let processor = DeliveryProcessor::new(
            handler,
            RetryPolicy::new(&retry, dead_letter_path),
            consumer.auto_ack,
            self.inner.span.clone(),
        );
        let consumer = Arc::new(Consumer::new(consumer, queue, binding, processor, self.inner.span.clone()));

        let channel = channels.current().await.ok_or(RabbitMQError::NotConnected)?;
        consumer.start(channel).await?;
        *slot = Some(consumer);
        Ok(())
    }

    /// Receiver for unroutable mandatory publishes. Only the first call gets it.
    pub async fn take_returned_messages(&self) -> Option<mpsc::UnboundedReceiver<ReturnedMessage>> {
        self.inner.returns_rx.lock().await.take()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.connection.subscribe()
    }

    /// Stops the consumer, then closes channels and the connection without
    /// reconnecting.
    pub async fn close(mut self) -> Result<()> {
        if let Some(handler) = self.reconnect_handler.take() {
            handler.abort();
        }

        let consumer = self.inner.consumer.lock().await.take();
        if let Some(consumer) = consumer {
            consumer.close().await;
        }
        for channels in [&self.inner.consumer_channel, &self.inner.publisher_channel]
            .into_iter()
            .flatten()
        {
            if let Err(err) = channels.close().await {
                warn!(parent: &self.inner.span, role = channels.role(), error = %err, "closing channel failed");
            }
        }

        let closed = self.inner.connection.close().await;
        if let Some(supervisor) = self.supervisor.take() {
            if let Err(err) = supervisor.await {
                warn!(parent: &self.inner.span, error = %err, "connection supervisor ended abnormally");
            }
        }
        info!(parent: &self.inner.span, "queue manager closed");
        closed
    }
}

impl Inner {
    async fn handle_reconnects(self: Arc<Self>, mut events: broadcast::Receiver<ConnectionEvent>) {
        loop {
            match events.recv().await {
                Ok(ConnectionEvent::Reconnected { generation }) => self.restore(generation).await,
                Ok(ConnectionEvent::Lost { generation, .. }) => {
                    debug!(parent: &self.span, generation, "waiting for reconnect");
                }
                Ok(ConnectionEvent::Failed { error }) => {
                    error!(parent: &self.span, error = %error, "connection cannot be restored");
                    return;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(parent: &self.span, skipped, "missed connection events");
                }
                Err(RecvError::Closed) => return,
            }
        }
    }

    /// Re-opens both role channels on the new connection and re-applies the
    /// publisher confirm mode and the full consumer setup. The roles are
    /// restored independently; if either still fails after its retries the
    /// connection is closed so the supervisor starts a fresh cycle.
    async fn restore(&self, generation: u64) {
        let (publisher, consumer) = tokio::join!(
            self.restore_with_retry(Role::Publisher, generation),
            self.restore_with_retry(Role::Consumer, generation),
        );

        let mut failed = false;
        for (role, result) in [(Role::Publisher, publisher), (Role::Consumer, consumer)] {
            if let Err(err) = result {
                error!(parent: &self.span, role = role.as_str(), generation, error = %err, "restoring channel failed");
                failed = true;
            }
        }
        if failed {
            self.connection
                .force_close(generation, "restoring channels failed")
                .await;
        } else {
            info!(parent: &self.span, generation, "channels restored");
        }
    }

    /// Up to `max_attempt + 1` tries with a fixed pause, abandoned as soon as
    /// `generation` is no longer the live connection.
    async fn restore_with_retry(&self, role: Role, generation: u64) -> Result<()> {
        let attempts = self.reconnect.max_attempt.saturating_add(1);
        let mut attempt = 1;
        loop {
            let err = match self.restore_role(role).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            let current = self.connection.generation() == generation
                && self.connection.state() == ConnectionState::Connected;
            if attempt >= attempts || !current {
                return Err(err);
            }
            warn!(
                parent: &self.span,
                role = role.as_str(),
                attempt,
                max_attempts = attempts,
                error = %err,
                "restoring channel failed, retrying"
            );
            attempt += 1;
            sleep(self.reconnect.interval()).await;
        }
    }

    async fn restore_role(&self, role: Role) -> Result<()> {
        match role {
            Role::Publisher => {
                let Some(channels) = &self.publisher_channel else {
                    return Ok(());
                };
                let channel = channels.open().await?;
                let publisher = self.publisher.read().await.clone();
                if let Some(publisher) = publisher {
                    publisher.attach(channel).await?;
                }
            }
            Role::Consumer => {
                let Some(channels) = &self.consumer_channel else {
                    return Ok(());
                };
                let consumer = self.consumer.lock().await;
                let channel = channels.open().await?;
                if let Some(consumer) = consumer.as_ref() {
                    consumer.start(channel).await?;
                }
            }
        }
        Ok(())
    }

    /// The role's channel, or a short-lived one when the role is disabled.
    async fn topology_channel(&self, role: Option<&ChannelManager>) -> Result<(Arc<dyn BrokerChannel>, bool)> {
        if let Some(channels) = role {
            let channel = channels.current().await.ok_or(RabbitMQError::NotConnected)?;
            return Ok((channel, false));
        }
        let (channel, _) = self.connection.open_channel().await?;
        Ok((channel, true))
    }

    async fn release(channel: Arc<dyn BrokerChannel>, temporary: bool) {
        if temporary {
            if let Err(err) = channel.close("topology declared").await {
                debug!(error = %err, "closing topology channel failed");
            }
        }
    }
}
