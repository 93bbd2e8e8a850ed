use std::sync::Arc;
use std::time::Duration;

use taskbus::message::InboundMessage;
use taskbus::rabbitmq::broker::ExchangeKind;
use taskbus::rabbitmq::memory::MemoryBroker;
use taskbus::rabbitmq::{ChannelConfig, MessageHandler, RabbitChannel, ShutdownCoordinator};
use tokio::sync::mpsc;

pub const ACTIONS: &str = "actions";

/// A delivery as seen by a test handler.
#[derive(Debug, Clone)]
pub struct Seen {
    pub queue: String,
    pub routing_key: String,
    pub body: String,
    pub redelivered: bool,
}

pub async fn connect(broker: &MemoryBroker) -> RabbitChannel {
    connect_with(broker, ChannelConfig::default()).await
}

pub async fn connect_with(broker: &MemoryBroker, config: ChannelConfig) -> RabbitChannel {
    broker.create_exchange(ACTIONS, ExchangeKind::Topic, true);
    RabbitChannel::connect(Arc::new(broker.clone()), config, ShutdownCoordinator::new())
        .await
        .unwrap()
}

/// Handler that reports every delivery on `tx`.
pub fn recorder(queue: &str, tx: mpsc::UnboundedSender<Seen>) -> impl MessageHandler {
    let queue = queue.to_string();
    move |message: Arc<InboundMessage>| {
        let seen = Seen {
            queue: queue.clone(),
            routing_key: message.routing_key.clone(),
            body: String::from_utf8_lossy(&message.body).to_string(),
            redelivered: message.redelivered,
        };
        let tx = tx.clone();
        async move {
            let _ = tx.send(seen);
            Ok::<(), anyhow::Error>(())
        }
    }
}

pub async fn next(rx: &mut mpsc::UnboundedReceiver<Seen>) -> Seen {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a delivery")
        .expect("handler channel closed")
}

/// Polls `condition` until it holds or two seconds pass.
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
