use std::sync::Arc;
use std::time::Duration;

use taskbus::message::InboundMessage;
use taskbus::rabbitmq::memory::{Disposition, MemoryBroker};
use taskbus::rabbitmq::{BusError, ChannelConfig};
use tokio::sync::{mpsc, Mutex};

use crate::support::{connect, connect_with, eventually, next, recorder, ACTIONS};

#[tokio::test]
async fn test_consumers_recovered_after_connection_loss() {
    let broker = MemoryBroker::new();
    let channel = connect(&broker).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    channel
        .register_consumer(ACTIONS, "clickup", "task.*.clickup", recorder("clickup", tx.clone()))
        .await
        .unwrap();
    channel
        .register_consumer(ACTIONS, "jira", "task.*.jira", recorder("jira", tx))
        .await
        .unwrap();

    for round in 0..3 {
        broker.drop_connections("broker restart");
        eventually(|| broker.consumer_tags("clickup").len() == 1 && broker.consumer_tags("jira").len() == 1).await;
        assert!(channel.is_alive());
        assert_eq!(broker.connections_opened(), round + 2);
        assert_eq!(broker.open_sessions(), 1);
    }

    assert_eq!(broker.publish_external(ACTIONS, "task.create.jira", b"{}"), 1);
    let seen = next(&mut rx).await;
    assert_eq!(seen.queue, "jira");
    assert_eq!(channel.consumer_names(), vec!["clickup", "jira"]);
}

#[tokio::test]
async fn test_unacked_delivery_is_redelivered_after_reconnect() {
    let broker = MemoryBroker::new();
    let channel = connect(&broker).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (release, released) = tokio::sync::oneshot::channel::<()>();
    let gate = Arc::new(Mutex::new(Some(released)));

    channel
        .register_consumer(ACTIONS, "jobs", "task.#", move |message: Arc<InboundMessage>| {
            let tx = tx.clone();
            let gate = gate.clone();
            async move {
                let _ = tx.send(message.redelivered);
                // Only the first delivery blocks, standing in for slow work.
                if let Some(released) = gate.lock().await.take() {
                    let _ = released.await;
                }
                Ok::<(), anyhow::Error>(())
            }
        })
        .await
        .unwrap();

    broker.publish_external(ACTIONS, "task.create.clickup", b"{}");
    assert_eq!(rx.recv().await, Some(false));

    broker.drop_connections("network partition");
    let redelivered = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
    assert_eq!(redelivered, Some(true));

    // The stale listener's ack goes to a dead channel and is only logged.
    release.send(()).unwrap();
    eventually(|| broker.unacked_count("jobs") == 0).await;
    let acked: Vec<_> = broker
        .dispositions()
        .into_iter()
        .filter(|d| d.disposition == Disposition::Acked)
        .collect();
    assert_eq!(acked.len(), 1);
    assert_eq!(broker.ready_count("jobs"), 0);
}

#[tokio::test]
async fn test_failed_reconnect_is_fatal() {
    let broker = MemoryBroker::new();
    let channel = connect(&broker).await;
    let (tx, _rx) = mpsc::unbounded_channel();
    channel
        .register_consumer(ACTIONS, "jobs", "task.#", recorder("jobs", tx))
        .await
        .unwrap();

    broker.set_reachable(false);
    broker.drop_connections("broker gone");

    let outcome = tokio::time::timeout(Duration::from_secs(2), channel.shutdown().wait())
        .await
        .unwrap();
    assert!(matches!(outcome, Err(ref e) if e.is_fatal()));
    assert!(!channel.is_alive());
    assert!(matches!(
        channel.publish(&"late", ACTIONS, "task.x", false).await,
        Err(BusError::ShuttingDown)
    ));
}

#[tokio::test]
async fn test_reconnect_retries_before_fatal_when_configured() {
    let broker = MemoryBroker::new();
    let config = ChannelConfig {
        reconnect_attempts: 5,
        reconnect_delay: Duration::from_millis(20),
        ..ChannelConfig::default()
    };
    let channel = connect_with(&broker, config).await;

    broker.set_reachable(false);
    broker.drop_connections("broker restart");
    tokio::time::sleep(Duration::from_millis(30)).await;
    broker.set_reachable(true);

    eventually(|| channel.is_alive()).await;
    assert!(!channel.shutdown().is_raised());
}

#[tokio::test]
async fn test_wildcard_bindings_route_independently() {
    let broker = MemoryBroker::new();
    let channel = connect(&broker).await;
    let (created_tx, mut created_rx) = mpsc::unbounded_channel();
    let (updated_tx, mut updated_rx) = mpsc::unbounded_channel();

    channel
        .register_consumer(ACTIONS, "created", "t.*.created", recorder("created", created_tx))
        .await
        .unwrap();
    channel
        .register_consumer(ACTIONS, "updated", "t.clickup.updated", recorder("updated", updated_tx))
        .await
        .unwrap();

    for key in ["t.clickup.created", "t.jira.created", "t.clickup.updated"] {
        broker.publish_external(ACTIONS, key, b"{}");
    }

    assert_eq!(next(&mut created_rx).await.routing_key, "t.clickup.created");
    assert_eq!(next(&mut created_rx).await.routing_key, "t.jira.created");
    assert_eq!(next(&mut updated_rx).await.routing_key, "t.clickup.updated");

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(created_rx.try_recv().is_err());
    assert!(updated_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_handler_outcomes_settle_each_delivery_once() {
    let broker = MemoryBroker::new();
    let channel = connect(&broker).await;

    channel
        .register_consumer(ACTIONS, "jobs", "task.#", |message: Arc<InboundMessage>| async move {
            if message.routing_key.ends_with("bad") {
                anyhow::bail!("rejected {}", message.routing_key);
            }
            Ok(())
        })
        .await
        .unwrap();

    for key in ["task.good", "task.bad", "task.good"] {
        broker.publish_external(ACTIONS, key, b"{}");
    }
    eventually(|| broker.dispositions().len() == 3).await;

    let dispositions: Vec<_> = broker
        .dispositions()
        .into_iter()
        .map(|d| (d.routing_key, d.disposition))
        .collect();
    assert_eq!(
        dispositions,
        vec![
            ("task.good".to_string(), Disposition::Acked),
            ("task.bad".to_string(), Disposition::Nacked { requeue: false }),
            ("task.good".to_string(), Disposition::Acked),
        ]
    );
    assert_eq!(broker.ready_count("jobs"), 0);
}

#[tokio::test]
async fn test_one_failed_recovery_does_not_block_others() {
    let broker = MemoryBroker::new();
    let channel = connect(&broker).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    for name in ["a", "b", "c"] {
        channel
            .register_consumer(ACTIONS, name, &format!("task.{}", name), recorder(name, tx.clone()))
            .await
            .unwrap();
    }

    broker.fail_next_consume("b");
    broker.drop_connections("broker restart");
    eventually(|| broker.consumer_tags("a").len() == 1 && broker.consumer_tags("c").len() == 1).await;
    assert!(broker.consumer_tags("b").is_empty());

    broker.publish_external(ACTIONS, "task.c", b"{}");
    assert_eq!(next(&mut rx).await.queue, "c");

    // The record is kept, so the next reconnect brings "b" back.
    broker.drop_connections("broker restart");
    eventually(|| broker.consumer_tags("b").len() == 1).await;
    broker.publish_external(ACTIONS, "task.b", b"{}");
    assert_eq!(next(&mut rx).await.queue, "b");
}

#[tokio::test]
async fn test_unregistered_consumer_is_not_recovered() {
    let broker = MemoryBroker::new();
    let channel = connect(&broker).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    channel
        .register_consumer(ACTIONS, "jobs", "task.#", recorder("jobs", tx))
        .await
        .unwrap();
    channel.unregister_consumer("jobs").await.unwrap();
    assert!(channel.consumer_names().is_empty());

    broker.drop_connections("broker restart");
    eventually(|| broker.connections_opened() == 2 && channel.is_alive()).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    broker.publish_external(ACTIONS, "task.create", b"{}");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(broker.ready_count("jobs"), 1);
    assert!(matches!(
        channel.unregister_consumer("jobs").await,
        Err(BusError::UnknownConsumer(_))
    ));
}

#[tokio::test]
async fn test_shutdown_drains_then_refuses_new_work() {
    let broker = MemoryBroker::new();
    let channel = connect(&broker).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    channel
        .register_consumer(ACTIONS, "jobs", "task.#", recorder("jobs", tx.clone()))
        .await
        .unwrap();
    broker.publish_external(ACTIONS, "task.one", b"{}");
    assert_eq!(next(&mut rx).await.routing_key, "task.one");

    channel.shutdown().signal();
    tokio::time::timeout(Duration::from_secs(2), channel.shutdown().wait())
        .await
        .unwrap()
        .unwrap();
    assert!(broker.consumer_tags("jobs").is_empty());

    assert!(matches!(
        channel
            .register_consumer(ACTIONS, "late", "task.#", recorder("late", tx))
            .await,
        Err(BusError::ShuttingDown)
    ));
    assert!(matches!(
        channel.publish(&"late", ACTIONS, "task.two", true).await,
        Err(BusError::ShuttingDown)
    ));

    channel.close().await.unwrap();
    assert!(!channel.is_alive());
    assert_eq!(broker.open_sessions(), 0);
}

#[tokio::test]
async fn test_publish_after_close_reports_connection_lost() {
    let broker = MemoryBroker::new();
    let channel = connect(&broker).await;
    channel.close().await.unwrap();

    let err = channel.publish(&"x", ACTIONS, "task.x", false).await.unwrap_err();
    assert!(matches!(err, BusError::ConnectionLost));
}
