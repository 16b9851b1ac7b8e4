use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument, Span};
use uuid::Uuid;

use super::errors::Result;
use super::event_handler::DeliveryProcessor;
use super::options::ConsumerConfig;
use super::topology::{Queue, QueueBindConfig, QueueConfig, RmqQueue};
use super::transport::{BrokerChannel, DeliveryStream};

type SharedStream = Arc<Mutex<DeliveryStream>>;

/// Registers on a queue and feeds deliveries to a fixed pool of workers.
pub struct Consumer {
    config: ConsumerConfig,
    queue: Option<QueueConfig>,
    binding: Option<QueueBindConfig>,
    processor: Arc<DeliveryProcessor>,
    closed: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    span: Span,
}

impl Consumer {
    pub fn new(
        mut config: ConsumerConfig,
        queue: Option<QueueConfig>,
        binding: Option<QueueBindConfig>,
        processor: DeliveryProcessor,
        span: Span,
    ) -> Self {
        if config.name.is_empty() {
            config.name = format!("consumer-{}", Uuid::new_v4());
        }
        let (closed, _) = watch::channel(false);
        Self {
            config,
            queue,
            binding,
            processor: Arc::new(processor),
            closed,
            workers: Mutex::new(Vec::new()),
            span,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.config.queue
    }

    pub fn tag(&self) -> &str {
        &self.config.name
    }

    /// Applies QoS, declares and binds the queue, registers the consumer and
    /// starts the workers. Runs again on every new channel after a reconnect.
    pub async fn start(&self, channel: Arc<dyn BrokerChannel>) -> Result<()> {
        let closed = *self.closed.borrow();
        if closed {
            debug!(parent: &self.span, queue = %self.config.queue, "consumer closed, not starting");
            return Ok(());
        }

        if self.config.enabled_prefetch {
            channel
                .qos(
                    self.config.prefetch_count,
                    self.config.prefetch_size,
                    self.config.global,
                )
                .await?;
        }

        if let Some(queue) = &self.queue {
            let queue = RmqQueue::new(queue.clone(), self.span.clone());
            queue.declare(channel.as_ref()).await?;
            if let Some(binding) = &self.binding {
                queue.bind(channel.as_ref(), binding).await?;
            }
        } else if let Some(binding) = &self.binding {
            channel.queue_bind(binding).await?;
        }

        let stream: SharedStream = Arc::new(Mutex::new(channel.consume(&self.config).await?));

        let mut workers = self.workers.lock().await;
        // Workers of an earlier channel exit on their own once its stream ends.
        workers.retain(|worker| !worker.is_finished());
        for index in 0..self.config.concurrency.max(1) {
            let worker = Worker {
                index,
                channel: channel.id(),
                stream: Arc::clone(&stream),
                processor: Arc::clone(&self.processor),
                closed: self.closed.subscribe(),
            };
            workers.push(tokio::spawn(worker.run().instrument(self.span.clone())));
        }

        info!(
            parent: &self.span,
            queue = %self.config.queue,
            consumer = %self.config.name,
            channel = channel.id(),
            workers = self.config.concurrency,
            "consumer started"
        );
        Ok(())
    }

    /// Stops taking new deliveries and waits for in-flight ones to finish.
    /// Prefetched deliveries that were never handed to a worker stay
    /// unacknowledged and return to the queue when the channel closes.
    pub async fn close(&self) {
        self.closed.send_replace(true);
        let workers = std::mem::take(&mut *self.workers.lock().await);
        for worker in workers {
            if let Err(err) = worker.await {
                warn!(parent: &self.span, error = %err, "consumer worker ended abnormally");
            }
        }
        info!(parent: &self.span, queue = %self.config.queue, "consumer closed");
    }
}

struct Worker {
    index: usize,
    channel: u16,
    stream: SharedStream,
    processor: Arc<DeliveryProcessor>,
    closed: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        debug!(worker = self.index, channel = self.channel, "worker started");
        loop {
            let stop = *self.closed.borrow_and_update();
            if stop {
                break;
            }

            let next = {
                let mut stream = self.stream.lock().await;
                tokio::select! {
                    next = stream.next() => next,
                    changed = self.closed.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                }
            };

            match next {
                Some(Ok(message)) => {
                    let message_id = message.id().to_string();
                    let outcome = self.processor.process(message).await;
                    debug!(worker = self.index, message_id = %message_id, ?outcome, "delivery handled");
                }
                Some(Err(err)) => {
                    error!(worker = self.index, channel = self.channel, error = %err, "delivery stream failed");
                    break;
                }
                None => break,
            }
        }
        debug!(worker = self.index, channel = self.channel, "worker stopped");
    }
}
