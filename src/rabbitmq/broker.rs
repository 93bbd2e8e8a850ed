// src/rabbitmq/broker.rs
//! The seam between the channel logic and a concrete broker client.
//!
//! A [`Transport`] dials the broker and opens one channel on the new
//! connection, handing back a [`Session`] (the live channel handle) together
//! with a notification receiver that fires when the connection or the
//! channel is lost. Everything above this module talks to `dyn Session`
//! only, which is what lets the reconnect loop swap handles wholesale.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tokio::sync::mpsc;

use super::errors::Result;
use crate::message::{InboundMessage, OutboundMessage};

/// Fires once per physical connection when it (or its channel) is lost.
pub type LossNotify = mpsc::UnboundedReceiver<String>;

/// Deliveries of one subscription, in broker order. The stream ends when
/// the subscription is cancelled or the channel goes away.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Resolves once the broker confirms (or rejects) one publish.
pub type PendingConfirm = BoxFuture<'static, Result<ConfirmOutcome>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Ack,
    Nack,
    /// The channel is not in confirm mode.
    NotRequested,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExchangeKind {
    Topic,
    Direct,
    Fanout,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExchangeKind::Topic => "topic",
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExchangeDeclaration {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
    /// Only verify that the exchange exists; never create it.
    pub passive: bool,
}

impl ExchangeDeclaration {
    /// Durable, non-auto-deleted topic exchange.
    pub fn topic(name: &str, passive: bool) -> Self {
        ExchangeDeclaration {
            name: name.to_string(),
            kind: ExchangeKind::Topic,
            durable: true,
            auto_delete: false,
            passive,
        }
    }
}

pub struct Connected {
    pub session: Arc<dyn Session>,
    pub lost: LossNotify,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establishes a physical connection and opens one channel on it.
    async fn open(&self) -> Result<Connected>;
}

/// One live channel handle. Implementations must be cheap to share behind
/// an `Arc`; none of the methods may be called once `close` has returned.
#[async_trait]
pub trait Session: Send + Sync {
    /// Identifier for logging.
    fn id(&self) -> &str;

    fn is_connected(&self) -> bool;

    async fn enable_confirms(&self) -> Result<()>;

    /// Bounds the unacknowledged deliveries outstanding per consumer.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    async fn declare_exchange(&self, declaration: &ExchangeDeclaration) -> Result<()>;

    /// Declares a durable queue.
    async fn declare_queue(&self, name: &str) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Opens a manual-ack subscription.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    /// Hands the message to the channel. The returned future is only worth
    /// awaiting when the caller wants the broker confirmation.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<PendingConfirm>;

    async fn close(&self) -> Result<()>;
}

/// Terminal disposition of a single delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// An inbound envelope. Acknowledging consumes it, so a delivery can reach
/// exactly one terminal disposition.
pub struct Delivery {
    message: Arc<InboundMessage>,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(message: InboundMessage, acker: Box<dyn Acknowledger>) -> Self {
        Delivery {
            message: Arc::new(message),
            acker,
        }
    }

    pub fn message(&self) -> &Arc<InboundMessage> {
        &self.message
    }

    pub fn delivery_tag(&self) -> u64 {
        self.message.delivery_tag
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.message.routing_key)
            .field("delivery_tag", &self.message.delivery_tag)
            .finish()
    }
}
