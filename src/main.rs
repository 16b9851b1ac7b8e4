use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rmq_manager::config::{self, RabbitConfig};
use rmq_manager::env::EnvConfig;
use rmq_manager::rabbitmq::{
    ConsumeOptions, DeadLetterCause, Message, MessageHandler, PublishOptions,
    Publishing, QueueManager,
};

#[derive(Debug, Serialize, Deserialize)]
struct DemoEvent {
    sequence: u32,
    content: String,
}

struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn process_event(&self, message: &Message) -> anyhow::Result<()> {
        let event: DemoEvent = message.json()?;
        info!(
            message_id = %message.id(),
            routing_key = %message.routing_key(),
            sequence = event.sequence,
            "received: {}",
            event.content
        );
        Ok(())
    }

    async fn process_dead_message(&self, message: &Message, cause: &DeadLetterCause) -> anyhow::Result<()> {
        warn!(message_id = %message.id(), %cause, "giving up on message");
        Ok(())
    }
}

fn load_settings() -> Result<RabbitConfig> {
    match config::load_config() {
        Ok(config) => Ok(config),
        Err(err) => {
            info!("No config file used ({err}), falling back to environment");
            let env = EnvConfig::load().context("Failed to read connection settings from environment")?;
            let defaults = config::default_config();
            Ok(RabbitConfig {
                manager: env.manager_config(),
                consumer: defaults
                    .consumer
                    .map(|consumer| consumer.with_prefetch(env.rabbitmq_prefetch_count)),
                ..defaults
            })
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = load_settings()?;
    let manager = QueueManager::new(settings.manager.clone())
        .await
        .context("Failed to start queue manager")?;

    if let Some(exchange_config) = settings.exchange.clone() {
        let exchange = manager.create_exchange(exchange_config).await?;
        if let (Some(queue), Some(binding)) = (settings.queue.clone(), settings.binding.clone()) {
            manager.create_and_bind_queue(queue, binding).await?;
        }
        if let Some(publisher) = settings.publisher.clone() {
            manager.create_publisher(exchange, publisher).await?;
        }
    }

    if let Some(mut returned) = manager.take_returned_messages().await {
        tokio::spawn(async move {
            while let Some(message) = returned.recv().await {
                warn!(
                    reply_code = message.reply_code,
                    routing_key = %message.routing_key,
                    "message returned by broker: {}",
                    message.reply_text
                );
            }
        });
    }

    if let Some(consumer) = settings.consumer.clone() {
        let options = ConsumeOptions::builder()
            .consumer(consumer)
            .retry(settings.retry.clone())
            .build()?;
        manager.consume(Arc::new(LoggingHandler), options).await?;
    }

    if settings.publisher.is_some() {
        for sequence in 0..3 {
            let event = DemoEvent {
                sequence,
                content: "Message from producer".to_string(),
            };
            let body = serde_json::to_vec(&event)?;
            let options = PublishOptions::builder()
                .publishing(Publishing::default().persistent())
                .build();
            match manager.publish(body, options).await {
                Ok(message_id) => info!(%message_id, sequence, "published"),
                Err(err) => error!(error = %err, sequence, "publish failed"),
            }
        }
    }

    info!("Running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
    info!("Shutting down");
    manager.close().await?;
    Ok(())
}
