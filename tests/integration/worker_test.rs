use std::sync::Arc;

use taskbus::config::WorkerConfig;
use taskbus::message::InboundMessage;
use taskbus::rabbitmq::memory::{Disposition, MemoryBroker};
use taskbus::rabbitmq::{BusError, ChannelConfig, RabbitChannel, ShutdownCoordinator};
use taskbus::worker::{self, ActionProcessed};
use tokio::sync::mpsc;

use crate::support::{connect, eventually};

async fn watch_events(channel: &RabbitChannel) -> mpsc::UnboundedReceiver<ActionProcessed> {
    let (tx, rx) = mpsc::unbounded_channel();
    channel
        .register_consumer("events", "processed", "#.processed", move |message: Arc<InboundMessage>| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message.json::<ActionProcessed>()?);
                Ok::<(), anyhow::Error>(())
            }
        })
        .await
        .unwrap();
    rx
}

#[tokio::test]
async fn test_actions_are_relayed_as_processed_events() {
    let broker = MemoryBroker::new();
    let channel = connect(&broker).await;
    worker::start(&channel, &WorkerConfig::default()).await.unwrap();
    let mut events = watch_events(&channel).await;

    assert_eq!(
        channel.consumer_names(),
        vec!["processed", "task.create.clickup", "task.create.jira", "task.update.clickup"]
    );

    broker.publish_external("actions", "task.create.jira", br#"{"title":"Broken login"}"#);
    let event = tokio::time::timeout(std::time::Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(event.action, "task.create.jira");
    assert_eq!(event.payload["title"], "Broken login");
    assert!(event.source_message_id.is_some());
}

#[tokio::test]
async fn test_malformed_action_is_dropped() {
    let broker = MemoryBroker::new();
    let channel = connect(&broker).await;
    worker::start(&channel, &WorkerConfig::default()).await.unwrap();

    broker.publish_external("actions", "task.update.clickup", b"not json");
    eventually(|| !broker.dispositions().is_empty()).await;

    let record = &broker.dispositions()[0];
    assert_eq!(record.queue, "task.update.clickup");
    assert_eq!(record.disposition, Disposition::Nacked { requeue: false });
    assert_eq!(broker.ready_count("task.update.clickup"), 0);
}

#[tokio::test]
async fn test_passive_start_requires_existing_exchanges() {
    let broker = MemoryBroker::new();
    let channel = RabbitChannel::connect(
        Arc::new(broker.clone()),
        ChannelConfig::default(),
        ShutdownCoordinator::new(),
    )
    .await
    .unwrap();
    let config = WorkerConfig {
        assume_exchanges_exist: true,
        ..WorkerConfig::default()
    };

    let err = worker::start(&channel, &config).await.unwrap_err();
    assert!(matches!(err, BusError::Topology(_)));
    assert!(!broker.has_exchange("actions"));
    assert!(channel.consumer_names().is_empty());
}

#[tokio::test]
async fn test_actions_buffered_at_shutdown_are_redelivered() {
    let broker = MemoryBroker::new();
    let channel = connect(&broker).await;
    worker::start(&channel, &WorkerConfig::default()).await.unwrap();

    for title in ["one", "two", "three"] {
        let body = format!(r#"{{"title":"{}"}}"#, title);
        broker.publish_external("actions", "task.create.jira", body.as_bytes());
    }
    channel.shutdown().signal();
    tokio::time::timeout(std::time::Duration::from_secs(2), channel.shutdown().wait())
        .await
        .unwrap()
        .unwrap();

    assert!(broker.dispositions().is_empty());
    assert_eq!(broker.unacked_count("task.create.jira"), 3);

    channel.close().await.unwrap();
    assert_eq!(broker.ready_count("task.create.jira"), 3);
    assert_eq!(broker.unacked_count("task.create.jira"), 0);
}
