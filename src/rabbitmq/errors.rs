// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use std::time::Duration;
use thiserror::Error;
use tokio::time::error::Elapsed;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("RabbitMQ connection error: {0}")]
    Connection(String),

    #[error("RabbitMQ channel error: {0}")]
    Channel(String),

    /// The channel handle was closed underneath the caller. The connection
    /// manager replaces it out-of-band, so callers may retry.
    #[error("RabbitMQ channel is closed: {0}")]
    ChannelClosed(String),

    #[error("RabbitMQ: connection is lost")]
    ConnectionLost,

    #[error("RabbitMQ: failed to declare topology: {0}")]
    Topology(String),

    #[error("RabbitMQ consume error: {0}")]
    Consume(String),

    #[error("RabbitMQ publish error: {0}")]
    Publish(String),

    #[error("RabbitMQ: broker rejected the published message")]
    ConfirmNacked,

    #[error("RabbitMQ: delivery confirmation is not received within {0:?}")]
    ConfirmTimeout(Duration),

    #[error("RabbitMQ acknowledge error: {0}")]
    Ack(String),

    #[error("Message serialization error: {0}")]
    Serialization(#[from] SerdeError),

    #[error("RabbitMQ: shutdown in progress")]
    ShuttingDown,

    #[error("RabbitMQ: consumer `{0}` is already registered")]
    DuplicateConsumer(String),

    #[error("RabbitMQ: consumer `{0}` is not registered")]
    UnknownConsumer(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Unrecoverable state of the messaging layer. The host process is
    /// expected to exit and be restarted by its orchestrator.
    #[error("RabbitMQ fatal error: {0}")]
    Fatal(String),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, BusError>;

impl BusError {
    /// Send-side errors worth retrying once the handle has been replaced.
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::ChannelClosed(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, BusError::Fatal(_))
    }
}

// Converting from lapin errors
impl From<LapinError> for BusError {
    fn from(error: LapinError) -> Self {
        match error {
            LapinError::InvalidChannelState(_) | LapinError::InvalidConnectionState(_) => {
                BusError::ChannelClosed(error.to_string())
            }
            LapinError::IOError(_) | LapinError::MissingHeartbeatError => {
                BusError::Connection(error.to_string())
            }
            other => BusError::Channel(other.to_string()),
        }
    }
}

impl From<Elapsed> for BusError {
    fn from(_: Elapsed) -> Self {
        BusError::Timeout("Connection timed out".to_string())
    }
}
