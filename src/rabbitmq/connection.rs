// src/rabbitmq/connection.rs
// Owns the single live channel handle and replaces it when the broker drops us

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::broker::{Connected, LossNotify, Session, Transport};
use super::consumer::ConsumerRegistry;
use super::errors::{BusError, Result};
use super::shutdown::ShutdownCoordinator;

const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Configuration options for the managed channel
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Channel identifier for logging (defaults to a short UUID)
    pub id: String,

    /// Number of unacknowledged deliveries allowed per consumer
    pub prefetch_count: u16,

    /// How long a confirmed publish waits for the broker
    pub confirm_timeout: Duration,

    /// Send retries after the channel was found closed
    pub publish_max_retries: u32,

    /// First pause between send retries; doubles after each attempt
    pub publish_retry_delay: Duration,

    /// Connection attempts per recovery before the failure is fatal
    pub reconnect_attempts: u32,

    /// First pause between reconnect attempts; doubles after each attempt
    pub reconnect_delay: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            id: format!("channel-{}", &Uuid::new_v4().to_string()[..8]),
            prefetch_count: 3,
            confirm_timeout: Duration::from_secs(3),
            publish_max_retries: 5,
            publish_retry_delay: Duration::from_millis(100),
            reconnect_attempts: 1,
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    config: ChannelConfig,
    current: watch::Sender<Option<Arc<dyn Session>>>,
    closed: AtomicBool,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, config: ChannelConfig) -> Self {
        debug!(
            channel_id = %config.id,
            prefetch = %config.prefetch_count,
            "Creating connection manager"
        );

        Self {
            transport,
            config,
            current: watch::Sender::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Opens a connection and channel, switches the channel to confirm mode,
    /// applies the prefetch limit and publishes the new handle. The previous
    /// handle, if any, is closed. Returns the loss notification of the new
    /// connection.
    pub async fn connect(&self) -> Result<LossNotify> {
        let Connected { session, lost } = self.transport.open().await?;

        if let Err(err) = self.configure(session.as_ref()).await {
            let _ = session.close().await;
            return Err(err);
        }

        debug!(
            channel_id = %self.config.id,
            session = %session.id(),
            prefetch = %self.config.prefetch_count,
            "RabbitMQ: Channel is ready"
        );
        if let Some(previous) = self.current.send_replace(Some(session)) {
            if let Err(err) = previous.close().await {
                debug!(session = %previous.id(), error = %err, "Ignoring error while closing the replaced channel");
            }
        }
        Ok(lost)
    }

    async fn configure(&self, session: &dyn Session) -> Result<()> {
        session.enable_confirms().await?;
        session.set_prefetch(self.config.prefetch_count).await
    }

    /// Snapshot of the current handle. Never hold it across a reconnect.
    pub fn session(&self) -> Result<Arc<dyn Session>> {
        self.current.borrow().clone().ok_or(BusError::ConnectionLost)
    }

    /// Notified whenever the handle is replaced.
    pub fn watch_session(&self) -> watch::Receiver<Option<Arc<dyn Session>>> {
        self.current.subscribe()
    }

    /// Whether the current handle is usable. `false` means routing may
    /// silently fail until the handle is replaced.
    pub fn is_alive(&self) -> bool {
        !self.is_closed()
            && self
                .current
                .borrow()
                .as_ref()
                .is_some_and(|session| session.is_connected())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(session) = self.current.send_replace(None) {
            session.close().await?;
            debug!(channel_id = %self.config.id, "RabbitMQ: Connection is closed");
        }
        Ok(())
    }

    /// Blocks on loss notifications for the lifetime of the process and
    /// replaces the handle each time, then replays every registered consumer.
    /// A failed reconnect raises the fatal shutdown signal.
    pub(crate) async fn supervise(
        self: Arc<Self>,
        mut lost: LossNotify,
        registry: Arc<ConsumerRegistry>,
        shutdown: ShutdownCoordinator,
    ) {
        loop {
            let reason = tokio::select! {
                _ = shutdown.raised() => break,
                reason = lost.recv() => reason.unwrap_or_else(|| "connection closed".to_string()),
            };
            if self.is_closed() || shutdown.is_raised() {
                break;
            }

            warn!(channel_id = %self.config.id, reason = %reason, "RabbitMQ: service tries to reconnect");
            self.retire_current().await;

            match self.reconnect(&shutdown).await {
                Ok(next) => {
                    lost = next;
                    info!(channel_id = %self.config.id, "RabbitMQ: connection re-established");
                    registry.recover().await;
                }
                Err(BusError::ShuttingDown) => break,
                Err(BusError::Fatal(reason)) => {
                    shutdown.raise_fatal(reason);
                    break;
                }
                Err(other) => {
                    shutdown.raise_fatal(other.to_string());
                    break;
                }
            }
        }
        debug!(channel_id = %self.config.id, "Reconnect loop stopped");
    }

    // A channel-level failure can leave the connection itself open.
    async fn retire_current(&self) {
        let current = self.current.borrow().clone();
        if let Some(session) = current {
            if let Err(err) = session.close().await {
                debug!(error = %err, "Ignoring error while closing the lost channel");
            }
        }
    }

    async fn reconnect(&self, shutdown: &ShutdownCoordinator) -> Result<LossNotify> {
        let max_attempts = self.config.reconnect_attempts.max(1);
        let mut delay = self.config.reconnect_delay;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match self.connect().await {
                Ok(lost) => return Ok(lost),
                Err(err) => err,
            };

            error!(
                "Failed to reconnect to RabbitMQ (attempt {}/{}): {}",
                attempt, max_attempts, err
            );
            if attempt >= max_attempts {
                return Err(BusError::Fatal(format!(
                    "failed to reconnect to RabbitMQ after {} attempt(s): {}",
                    attempt, err
                )));
            }

            // Exponential backoff with jitter
            let millis = delay.as_millis() as f64;
            let jitter = (rand::random::<f64>() * 0.3 - 0.15) * millis;
            let sleep_time = Duration::from_millis((millis + jitter).max(0.0) as u64);
            info!("Waiting {}ms before next reconnect attempt", sleep_time.as_millis());

            tokio::select! {
                _ = shutdown.raised() => return Err(BusError::ShuttingDown),
                _ = sleep(sleep_time) => {}
            }
            delay = std::cmp::min(delay * 2, MAX_RECONNECT_DELAY);
        }
    }
}
