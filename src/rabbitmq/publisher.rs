// src/rabbitmq/publisher.rs
// Publishing with optional broker confirmation

use std::sync::Arc;

use serde::Serialize;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use super::broker::{ConfirmOutcome, PendingConfirm};
use super::connection::ConnectionManager;
use super::errors::{BusError, Result};
use super::shutdown::ShutdownCoordinator;
use crate::message::OutboundMessage;

pub struct Publisher {
    connection: Arc<ConnectionManager>,
    shutdown: ShutdownCoordinator,
}

impl Publisher {
    pub fn new(connection: Arc<ConnectionManager>, shutdown: ShutdownCoordinator) -> Self {
        Self {
            connection,
            shutdown,
        }
    }

    /// Serializes `message` as JSON and publishes it.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        message: &T,
        exchange: &str,
        routing_key: &str,
        confirm: bool,
    ) -> Result<()> {
        let message = OutboundMessage::json(message)?;
        self.publish_message(message, exchange, routing_key, confirm).await
    }

    /// With `confirm`, succeeds only on a positive broker confirmation
    /// received within the configured confirm timeout. Without it, succeeds
    /// as soon as the channel accepted the message.
    pub async fn publish_message(
        &self,
        message: OutboundMessage,
        exchange: &str,
        routing_key: &str,
        confirm: bool,
    ) -> Result<()> {
        let _operation = self.shutdown.begin_operation()?;
        if self.connection.is_closed() {
            return Err(BusError::ConnectionLost);
        }

        let message_id = message.message_id.clone();
        let pending = self.send(exchange, routing_key, message).await?;
        if !confirm {
            debug!(exchange = %exchange, routing_key = %routing_key, message_id = %message_id, "Message published");
            return Ok(());
        }

        let wait = self.connection.config().confirm_timeout;
        match timeout(wait, pending).await {
            Err(_) => Err(BusError::ConfirmTimeout(wait)),
            Ok(outcome) => match outcome? {
                ConfirmOutcome::Ack => {
                    debug!(
                        exchange = %exchange,
                        routing_key = %routing_key,
                        message_id = %message_id,
                        "Message published and confirmed"
                    );
                    Ok(())
                }
                ConfirmOutcome::Nack => Err(BusError::ConfirmNacked),
                ConfirmOutcome::NotRequested => Err(BusError::Publish(
                    "channel is not in confirm mode".to_string(),
                )),
            },
        }
    }

    // Retries a send that hit a closed channel, waking early when the
    // connection manager swaps in a new handle.
    async fn send(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<PendingConfirm> {
        let config = self.connection.config();
        let mut handles = self.connection.watch_session();
        let mut delay = config.publish_retry_delay;
        let mut retries = 0;

        loop {
            if self.connection.is_closed() {
                return Err(BusError::ConnectionLost);
            }
            let session = handles
                .borrow_and_update()
                .clone()
                .ok_or(BusError::ConnectionLost)?;

            match session.publish(exchange, routing_key, message.clone()).await {
                Err(err) if err.is_transient() && retries < config.publish_max_retries => {
                    retries += 1;
                    warn!(
                        exchange = %exchange,
                        routing_key = %routing_key,
                        attempt = retries,
                        error = %err,
                        "Channel closed during publish, retrying"
                    );
                    tokio::select! {
                        _ = self.shutdown.raised() => return Err(BusError::ShuttingDown),
                        _ = handles.changed() => {}
                        _ = sleep(delay) => {}
                    }
                    delay = delay.saturating_mul(2);
                }
                result => return result,
            }
        }
    }
}
