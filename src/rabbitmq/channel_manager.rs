use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument, Span};

use super::connection::ConnectionManager;
use super::errors::Result;
use super::transport::BrokerChannel;

/// Owns the channel of one role (publisher or consumer) and re-opens it on
/// request. A monitor task watches the channel; when the broker closes it
/// unexpectedly the parent connection is closed too, so the reconnect path
/// rebuilds everything from a clean connection.
pub struct ChannelManager {
    role: &'static str,
    connection: Arc<ConnectionManager>,
    current: RwLock<Option<Arc<dyn BrokerChannel>>>,
    closing: Arc<AtomicBool>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    span: Span,
}

impl ChannelManager {
    pub fn new(role: &'static str, connection: Arc<ConnectionManager>, span: Span) -> Self {
        debug!(parent: &span, role, "creating channel manager");
        Self {
            role,
            connection,
            current: RwLock::new(None),
            closing: Arc::new(AtomicBool::new(false)),
            monitor: Mutex::new(None),
            span,
        }
    }

    pub fn role(&self) -> &'static str {
        self.role
    }

    /// Opens a fresh channel on the current connection, replacing (and
    /// closing) the previous one.
    pub async fn open(&self) -> Result<Arc<dyn BrokerChannel>> {
        let (channel, generation) = self.connection.open_channel().await?;
        self.closing.store(false, Ordering::SeqCst);

        let mut monitor = self.monitor.lock().await;
        if let Some(previous) = monitor.take() {
            previous.abort();
        }
        let previous = self.current.write().await.replace(Arc::clone(&channel));
        if let Some(previous) = previous.filter(|previous| previous.is_open()) {
            if let Err(err) = previous.close("replaced").await {
                debug!(parent: &self.span, role = self.role, error = %err, "closing replaced channel failed");
            }
        }

        *monitor = Some(self.spawn_monitor(Arc::clone(&channel), generation));
        info!(parent: &self.span, role = self.role, channel = channel.id(), generation, "channel ready");
        Ok(channel)
    }

    fn spawn_monitor(&self, channel: Arc<dyn BrokerChannel>, generation: u64) -> JoinHandle<()> {
        let connection = Arc::clone(&self.connection);
        let closing = Arc::clone(&self.closing);
        let role = self.role;
        let span = self.span.clone();
        let mut signal = channel.close_signal();
        let id = channel.id();
        drop(channel);

        tokio::spawn(
            async move {
                let reason = signal.closed().await;
                if closing.load(Ordering::SeqCst) {
                    debug!(role, channel = id, "channel closed");
                    return;
                }
                warn!(role, channel = id, reason = %reason, "channel closed unexpectedly");
                connection.force_close(generation, &reason).await;
            }
            .instrument(span),
        )
    }

    pub async fn current(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.current.read().await.clone()
    }

    pub async fn is_healthy(&self) -> bool {
        self.current
            .read()
            .await
            .as_ref()
            .is_some_and(|channel| channel.is_open())
    }

    pub async fn close(&self) -> Result<()> {
        self.closing.store(true, Ordering::SeqCst);
        if let Some(monitor) = self.monitor.lock().await.take() {
            monitor.abort();
        }
        let channel = self.current.write().await.take();
        match channel {
            Some(channel) if channel.is_open() => {
                debug!(parent: &self.span, role = self.role, channel = channel.id(), "closing channel");
                channel.close("channel closed by client").await
            }
            _ => Ok(()),
        }
    }
}
