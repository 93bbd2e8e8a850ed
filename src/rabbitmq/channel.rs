// src/rabbitmq/channel.rs
//! The resilient channel as collaborators see it.
//!
//! [`RabbitChannel`] bundles the connection manager, consumer registry,
//! publisher and shutdown coordinator behind the three contracts the rest of
//! the process uses: register consumers, publish, and the lifecycle controls
//! (`close`, `is_alive`, plus the shutdown coordinator for draining).

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use super::broker::Transport;
use super::connection::{ChannelConfig, ConnectionManager};
use super::consumer::{ConsumerRecord, ConsumerRegistry, MessageHandler};
use super::errors::{BusError, Result};
use super::lapin_broker::LapinTransport;
use super::publisher::Publisher;
use super::routing::is_valid_routing_key;
use super::shutdown::ShutdownCoordinator;
use super::topology;
use crate::config::RabbitConfig;
use crate::message::OutboundMessage;

pub struct RabbitChannel {
    connection: Arc<ConnectionManager>,
    registry: Arc<ConsumerRegistry>,
    publisher: Arc<Publisher>,
    shutdown: ShutdownCoordinator,
}

impl RabbitChannel {
    /// Connects through `transport` and starts the reconnect loop. A failure
    /// here is a startup failure and is returned as is.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        config: ChannelConfig,
        shutdown: ShutdownCoordinator,
    ) -> Result<Self> {
        let connection = Arc::new(ConnectionManager::new(transport, config));
        let lost = connection.connect().await?;

        let registry = Arc::new(ConsumerRegistry::new(connection.clone(), shutdown.clone()));
        let publisher = Arc::new(Publisher::new(connection.clone(), shutdown.clone()));
        shutdown.spawn(
            connection
                .clone()
                .supervise(lost, registry.clone(), shutdown.clone()),
        );

        info!(channel_id = %connection.config().id, "RabbitMQ: channel is up");
        Ok(Self {
            connection,
            registry,
            publisher,
            shutdown,
        })
    }

    /// Connects to RabbitMQ through lapin using the file/env configuration.
    pub async fn connect_rabbitmq(config: &RabbitConfig, shutdown: ShutdownCoordinator) -> Result<Self> {
        let transport = LapinTransport::new(&config.uri(), config.connection_timeout());
        Self::connect(Arc::new(transport), config.channel_config(), shutdown).await
    }

    pub async fn declare_exchange(&self, name: &str, assume_exists: bool) -> Result<()> {
        let session = self.connection.session()?;
        topology::declare_exchange(session.as_ref(), name, assume_exists).await
    }

    /// Subscribes `handler` to `routing_key` on `exchange` through a durable
    /// queue named `queue`. The registration is replayed after every
    /// reconnect until it is unregistered.
    pub async fn register_consumer<H>(
        &self,
        exchange: &str,
        queue: &str,
        routing_key: &str,
        handler: H,
    ) -> Result<()>
    where
        H: MessageHandler,
    {
        if queue.is_empty() {
            return Err(BusError::Consume("queue name must not be empty".to_string()));
        }
        if !is_valid_routing_key(routing_key) {
            return Err(BusError::Topology(format!("invalid routing key `{}`", routing_key)));
        }

        self.registry
            .register(ConsumerRecord {
                name: queue.to_string(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                handler: Arc::new(handler),
            })
            .await
    }

    pub async fn unregister_consumer(&self, queue: &str) -> Result<()> {
        self.registry.unregister(queue).await
    }

    pub fn consumer_names(&self) -> Vec<String> {
        self.registry.names()
    }

    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        message: &T,
        exchange: &str,
        routing_key: &str,
        confirm: bool,
    ) -> Result<()> {
        self.publisher.publish(message, exchange, routing_key, confirm).await
    }

    pub async fn publish_message(
        &self,
        message: OutboundMessage,
        exchange: &str,
        routing_key: &str,
        confirm: bool,
    ) -> Result<()> {
        self.publisher
            .publish_message(message, exchange, routing_key, confirm)
            .await
    }

    /// A publisher handle for handlers that publish results. It keeps no
    /// reference to the consumer registry.
    pub fn publisher(&self) -> Arc<Publisher> {
        self.publisher.clone()
    }

    pub fn is_alive(&self) -> bool {
        self.connection.is_alive()
    }

    pub fn shutdown(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    pub async fn close(&self) -> Result<()> {
        self.connection.close().await
    }
}
