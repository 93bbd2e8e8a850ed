// src/rabbitmq/consumer.rs
// Consumer registration and replay after reconnect

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::connection::ConnectionManager;
use super::errors::{BusError, Result};
use super::listener::Listener;
use super::shutdown::ShutdownCoordinator;
use crate::message::InboundMessage;

/// Business logic invoked once per delivery. An error drops the message
/// (nack without requeue); it is never reported to the registering caller.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: Arc<InboundMessage>) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Arc<InboundMessage>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: Arc<InboundMessage>) -> anyhow::Result<()> {
        (self)(message).await
    }
}

/// Everything needed to replay one subscription. Immutable once stored.
#[derive(Clone)]
pub struct ConsumerRecord {
    pub name: String,
    pub exchange: String,
    pub routing_key: String,
    pub handler: Arc<dyn MessageHandler>,
}

impl fmt::Debug for ConsumerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerRecord")
            .field("name", &self.name)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .finish()
    }
}

struct Slot {
    record: ConsumerRecord,
    // Id of the handle the record is currently subscribed on.
    session: String,
}

pub struct ConsumerRegistry {
    connection: Arc<ConnectionManager>,
    shutdown: ShutdownCoordinator,
    records: Mutex<BTreeMap<String, Slot>>,
    // Serializes register, unregister and recover so a record is never
    // subscribed twice on the same handle.
    registration: tokio::sync::Mutex<()>,
}

impl ConsumerRegistry {
    pub fn new(connection: Arc<ConnectionManager>, shutdown: ShutdownCoordinator) -> Self {
        Self {
            connection,
            shutdown,
            records: Mutex::new(BTreeMap::new()),
            registration: tokio::sync::Mutex::new(()),
        }
    }

    fn records(&self) -> MutexGuard<'_, BTreeMap<String, Slot>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Declares the durable queue `record.name`, binds it, subscribes with the
    /// queue name as consumer tag, stores the record and starts its listener.
    pub async fn register(&self, record: ConsumerRecord) -> Result<()> {
        let _operation = self.shutdown.begin_operation()?;
        let _registration = self.registration.lock().await;
        if self.records().contains_key(&record.name) {
            return Err(BusError::DuplicateConsumer(record.name));
        }

        let session = self.subscribe(&record).await?;

        info!(
            queue = %record.name,
            exchange = %record.exchange,
            routing_key = %record.routing_key,
            "Consumer registered"
        );
        self.records()
            .insert(record.name.clone(), Slot { record, session });
        Ok(())
    }

    /// Forgets the record and cancels its subscription; the listener drains
    /// what it already holds and stops.
    pub async fn unregister(&self, name: &str) -> Result<()> {
        let _registration = self.registration.lock().await;
        let removed = self.records().remove(name);
        if removed.is_none() {
            return Err(BusError::UnknownConsumer(name.to_string()));
        }

        let session = self.connection.session()?;
        session.cancel(name).await?;
        info!(queue = %name, "Consumer unregistered");
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        self.records().keys().cloned().collect()
    }

    /// Re-subscribes every stored record on the current handle and returns
    /// how many are live on it. Records already subscribed there are left
    /// alone. A record that fails is logged and skipped; the next reconnect
    /// retries it.
    pub async fn recover(&self) -> usize {
        let _registration = self.registration.lock().await;
        let Ok(current) = self.connection.session() else {
            warn!("No live channel, consumer recovery skipped");
            return 0;
        };

        let (stale, mut live): (Vec<ConsumerRecord>, usize) = {
            let records = self.records();
            let stale: Vec<ConsumerRecord> = records
                .values()
                .filter(|slot| slot.session != current.id())
                .map(|slot| slot.record.clone())
                .collect();
            let live = records.len() - stale.len();
            (stale, live)
        };
        let total = stale.len() + live;

        for record in stale {
            if self.shutdown.is_raised() {
                debug!("Shutdown raised, consumer recovery stopped");
                break;
            }
            match self.subscribe(&record).await {
                Ok(session) => {
                    debug!(queue = %record.name, "Consumer recovered");
                    if let Some(slot) = self.records().get_mut(&record.name) {
                        slot.session = session;
                    }
                    live += 1;
                }
                Err(err) => {
                    error!(queue = %record.name, error = %err, "Failed to recover consumer");
                }
            }
        }

        info!(recovered = live, total, "RabbitMQ: consumers recovered");
        live
    }

    // Returns the id of the handle the subscription was made on.
    async fn subscribe(&self, record: &ConsumerRecord) -> Result<String> {
        let session = self.connection.session()?;
        session.declare_queue(&record.name).await?;
        session
            .bind_queue(&record.name, &record.exchange, &record.routing_key)
            .await?;
        let deliveries = session.consume(&record.name, &record.name).await?;

        let session_id = session.id().to_string();
        let listener = Listener::new(
            record.name.clone(),
            session,
            deliveries,
            record.handler.clone(),
            self.shutdown.clone(),
        );
        self.shutdown.spawn(listener.run());
        Ok(session_id)
    }
}
