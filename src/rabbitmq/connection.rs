// src/rabbitmq/connection.rs

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn, Instrument, Span};

use super::connection_pool::ConnectionPool;
use super::errors::{RabbitMQError, Result};
use super::options::ReconnectConfig;
use super::transport::{BrokerChannel, BrokerConnection, CloseSignal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// Published to dependents whenever the physical connection changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Lost { generation: u64, reason: String },
    Reconnected { generation: u64 },
    Failed { error: String },
}

struct Live {
    connection: Arc<dyn BrokerConnection>,
    generation: u64,
}

/// Owns the single physical connection and the reconnect policy.
pub struct ConnectionManager {
    pool: Mutex<ConnectionPool>,
    policy: ReconnectConfig,
    current: RwLock<Option<Live>>,
    generation: AtomicU64,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    shutting_down: AtomicBool,
    connect_lock: Mutex<()>,
    span: Span,
}

impl ConnectionManager {
    pub fn new(pool: ConnectionPool, policy: ReconnectConfig, span: Span) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(16);
        Self {
            pool: Mutex::new(pool),
            policy,
            current: RwLock::new(None),
            generation: AtomicU64::new(0),
            state,
            events,
            shutting_down: AtomicBool::new(false),
            connect_lock: Mutex::new(()),
            span,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Generation of the most recent successful connect; 0 before the first.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Dials endpoints until one answers, trying `max_attempt + 1` times with
    /// a fixed pause between tries. Returns the new generation.
    pub async fn connect(&self) -> Result<u64> {
        let _guard = self.connect_lock.lock().await;
        let attempts = self.policy.max_attempt.saturating_add(1);
        let mut last_error = String::new();

        self.state.send_replace(ConnectionState::Connecting);
        for attempt in 1..=attempts {
            if self.shutting_down.load(Ordering::SeqCst) {
                self.state.send_replace(ConnectionState::Disconnected);
                return Err(RabbitMQError::NotConnected);
            }

            let dialed = self.pool.lock().await.acquire().await;
            match dialed {
                Ok(connection) => {
                    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    *self.current.write().await = Some(Live {
                        connection,
                        generation,
                    });
                    self.state.send_replace(ConnectionState::Connected);
                    info!(parent: &self.span, attempt, generation, "connected to RabbitMQ");
                    return Ok(generation);
                }
                Err(err) => {
                    warn!(
                        parent: &self.span,
                        attempt,
                        max_attempts = attempts,
                        error = %err,
                        "failed to connect to RabbitMQ"
                    );
                    last_error = err.to_string();
                    if attempt < attempts {
                        sleep(self.policy.interval()).await;
                    }
                }
            }
        }

        self.state.send_replace(ConnectionState::Failed);
        error!(parent: &self.span, attempts, "giving up on RabbitMQ connection");
        Err(RabbitMQError::ReconnectExhausted {
            attempts,
            last_error,
        })
    }

    /// Opens a channel on the live connection, returning it with the
    /// generation it belongs to.
    pub async fn open_channel(&self) -> Result<(Arc<dyn BrokerChannel>, u64)> {
        let (connection, generation) = {
            let current = self.current.read().await;
            match current.as_ref() {
                Some(live) if live.connection.is_connected() => {
                    (Arc::clone(&live.connection), live.generation)
                }
                _ => return Err(RabbitMQError::NotConnected),
            }
        };
        let channel = connection.open_channel().await?;
        debug!(parent: &self.span, channel = channel.id(), generation, "channel opened");
        Ok((channel, generation))
    }

    async fn close_signal(&self) -> Option<(CloseSignal, u64)> {
        let current = self.current.read().await;
        current
            .as_ref()
            .map(|live| (live.connection.close_signal(), live.generation))
    }

    /// Closes the connection if it is still `generation`. Channel monitors
    /// use this so a report about an old connection cannot tear down a new one.
    pub async fn force_close(&self, generation: u64, reason: &str) {
        let connection = {
            let current = self.current.read().await;
            match current.as_ref() {
                Some(live) if live.generation == generation && live.connection.is_connected() => {
                    Arc::clone(&live.connection)
                }
                _ => {
                    debug!(parent: &self.span, generation, "ignoring close for stale connection");
                    return;
                }
            }
        };
        warn!(parent: &self.span, generation, reason, "forcing connection close");
        if let Err(err) = connection.close(reason).await {
            warn!(parent: &self.span, error = %err, "error while forcing connection close");
        }
    }

    /// Watches the live connection and reconnects when it drops. Stops after
    /// `close()` or once reconnecting gives up.
    pub fn spawn_supervisor(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let span = self.span.clone();
        tokio::spawn(async move { manager.supervise().await }.instrument(span))
    }

    async fn supervise(&self) {
        loop {
            let Some((mut signal, generation)) = self.close_signal().await else {
                debug!(parent: &self.span, "no connection to supervise");
                return;
            };
            let reason = signal.closed().await;
            if self.shutting_down.load(Ordering::SeqCst) {
                debug!(parent: &self.span, "connection closed for shutdown");
                return;
            }

            warn!(parent: &self.span, generation, reason = %reason, "connection lost");
            self.state.send_replace(ConnectionState::Disconnected);
            let _ = self.events.send(ConnectionEvent::Lost { generation, reason });

            match self.connect().await {
                Ok(generation) => {
                    let _ = self.events.send(ConnectionEvent::Reconnected { generation });
                }
                Err(err) => {
                    if !self.shutting_down.load(Ordering::SeqCst) {
                        error!(parent: &self.span, error = %err, "reconnect failed");
                        let _ = self.events.send(ConnectionEvent::Failed {
                            error: err.to_string(),
                        });
                    }
                    return;
                }
            }
        }
    }

    /// Graceful shutdown; the supervisor will not reconnect afterwards.
    pub async fn close(&self) -> Result<()> {
        self.shutting_down.store(true, Ordering::SeqCst);
        let live = self.current.write().await.take();
        self.state.send_replace(ConnectionState::Disconnected);
        match live {
            Some(live) if live.connection.is_connected() => {
                info!(parent: &self.span, generation = live.generation, "closing RabbitMQ connection");
                live.connection.close("connection closed by client").await
            }
            _ => Ok(()),
        }
    }
}
