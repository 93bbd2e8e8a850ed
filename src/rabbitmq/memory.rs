// src/rabbitmq/memory.rs
//! In-process broker with topic-exchange semantics.
//!
//! Implements [`Transport`] so a [`RabbitChannel`](super::RabbitChannel) can
//! run without a RabbitMQ server. It keeps the parts of AMQP the channel
//! depends on: durable exchanges and queues survive connection loss,
//! deliveries are manual-ack and bounded by the session prefetch, unacked
//! deliveries are requeued as redelivered when their session dies, and
//! confirms are issued per publish. Fault injection hooks drive the
//! recovery paths in tests.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use futures::future;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::broker::{
    Acknowledger, ConfirmOutcome, Connected, Delivery, DeliveryStream, ExchangeDeclaration,
    ExchangeKind, PendingConfirm, Session, Transport,
};
use super::errors::{BusError, Result};
use super::routing::topic_matches;
use crate::message::{InboundMessage, OutboundMessage, JSON_CONTENT_TYPE};

/// How the broker answers publishes on a confirm-mode channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfirmMode {
    Ack,
    Nack,
    /// Never answer, as a broker under partition would.
    Withhold,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    Nacked { requeue: bool },
}

/// One terminal disposition observed by the broker.
#[derive(Clone, Debug)]
pub struct DispositionRecord {
    pub queue: String,
    pub routing_key: String,
    pub message_id: String,
    pub session: String,
    pub disposition: Disposition,
}

#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        let state = Arc::new_cyclic(|weak| Mutex::new(BrokerState::new(weak.clone())));
        Self { state }
    }
}

struct BrokerState {
    this: Weak<Mutex<BrokerState>>,
    exchanges: HashMap<String, ExchangeEntry>,
    queues: HashMap<String, QueueEntry>,
    bindings: Vec<Binding>,
    sessions: HashMap<u64, SessionEntry>,
    next_session: u64,
    reachable: bool,
    confirm_mode: ConfirmMode,
    connections_opened: usize,
    failing_publishes: usize,
    failing_acks: bool,
    failing_consumes: HashSet<String>,
    dispositions: Vec<DispositionRecord>,
}

impl BrokerState {
    fn new(this: Weak<Mutex<BrokerState>>) -> Self {
        Self {
            this,
            exchanges: HashMap::new(),
            queues: HashMap::new(),
            bindings: Vec::new(),
            sessions: HashMap::new(),
            next_session: 0,
            reachable: true,
            confirm_mode: ConfirmMode::Ack,
            connections_opened: 0,
            failing_publishes: 0,
            failing_acks: false,
            failing_consumes: HashSet::new(),
            dispositions: Vec::new(),
        }
    }
}

struct ExchangeEntry {
    kind: ExchangeKind,
    durable: bool,
    auto_delete: bool,
}

struct Binding {
    exchange: String,
    queue: String,
    pattern: String,
}

#[derive(Default)]
struct QueueEntry {
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerEntry>,
    cursor: usize,
}

struct ConsumerEntry {
    session: u64,
    tag: String,
    tx: mpsc::UnboundedSender<Result<Delivery>>,
    in_flight: usize,
}

#[derive(Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    content_type: Option<String>,
    message_id: String,
    redelivered: bool,
}

struct Unacked {
    queue: String,
    consumer_tag: String,
    message: StoredMessage,
}

struct SessionEntry {
    name: String,
    confirms: bool,
    prefetch: u16,
    next_tag: u64,
    lost_tx: Option<mpsc::UnboundedSender<String>>,
    unacked: BTreeMap<u64, Unacked>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates an exchange out-of-band, as a separate process owning the
    /// topology would.
    pub fn create_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) {
        self.lock().exchanges.insert(
            name.to_string(),
            ExchangeEntry {
                kind,
                durable,
                auto_delete: false,
            },
        );
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.lock().exchanges.contains_key(name)
    }

    /// While unreachable, every `open` fails with a connection error.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    pub fn set_confirm_mode(&self, mode: ConfirmMode) {
        self.lock().confirm_mode = mode;
    }

    /// The next `count` publishes fail as if the channel had just closed.
    pub fn fail_next_publishes(&self, count: usize) {
        self.lock().failing_publishes = count;
    }

    /// Makes every ack and nack fail until switched off.
    pub fn fail_acknowledgements(&self, failing: bool) {
        self.lock().failing_acks = failing;
    }

    /// The next subscription attempt on `queue` is refused.
    pub fn fail_next_consume(&self, queue: &str) {
        self.lock().failing_consumes.insert(queue.to_string());
    }

    /// Severs every open connection, requeueing their unacked deliveries.
    pub fn drop_connections(&self, reason: &str) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.sessions.keys().copied().collect();
        for id in ids {
            sever(&mut state, id, Some(reason));
        }
    }

    /// Publishes as an unrelated producer would, bypassing any session.
    /// Returns the number of queues the message was routed to.
    pub fn publish_external(&self, exchange: &str, routing_key: &str, body: &[u8]) -> usize {
        let mut state = self.lock();
        let message = StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
            content_type: Some(JSON_CONTENT_TYPE.to_string()),
            message_id: Uuid::new_v4().to_string(),
            redelivered: false,
        };
        enqueue(&mut state, message)
    }

    /// Messages waiting in `queue` that have not been delivered yet.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Deliveries from `queue` awaiting acknowledgement.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock()
            .sessions
            .values()
            .flat_map(|s| s.unacked.values())
            .filter(|u| u.queue == queue)
            .count()
    }

    pub fn consumer_tags(&self, queue: &str) -> Vec<String> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.iter().map(|c| c.tag.clone()).collect())
            .unwrap_or_default()
    }

    pub fn binding_patterns(&self, queue: &str) -> Vec<String> {
        self.lock()
            .bindings
            .iter()
            .filter(|b| b.queue == queue)
            .map(|b| b.pattern.clone())
            .collect()
    }

    pub fn dispositions(&self) -> Vec<DispositionRecord> {
        self.lock().dispositions.clone()
    }

    pub fn connections_opened(&self) -> usize {
        self.lock().connections_opened
    }

    pub fn open_sessions(&self) -> usize {
        self.lock().sessions.len()
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn open(&self) -> Result<Connected> {
        let mut state = self.lock();
        if !state.reachable {
            return Err(BusError::Connection(
                "failed to connect to RabbitMQ: connection refused".to_string(),
            ));
        }

        state.next_session += 1;
        state.connections_opened += 1;
        let id = state.next_session;
        let name = format!("memory-{}", id);
        let (lost_tx, lost) = mpsc::unbounded_channel();
        state.sessions.insert(
            id,
            SessionEntry {
                name: name.clone(),
                confirms: false,
                prefetch: 0,
                next_tag: 0,
                lost_tx: Some(lost_tx),
                unacked: BTreeMap::new(),
            },
        );
        debug!(session = %name, "Memory broker accepted a connection");

        Ok(Connected {
            session: Arc::new(MemorySession {
                id,
                name,
                state: Arc::downgrade(&self.state),
            }),
            lost,
        })
    }
}

struct MemorySession {
    id: u64,
    name: String,
    state: Weak<Mutex<BrokerState>>,
}

impl MemorySession {
    fn with_state<T>(&self, f: impl FnOnce(&mut BrokerState) -> Result<T>) -> Result<T> {
        let state = self
            .state
            .upgrade()
            .ok_or_else(|| BusError::ChannelClosed("broker is gone".to_string()))?;
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.sessions.contains_key(&self.id) {
            return Err(BusError::ChannelClosed(format!("channel {} is closed", self.name)));
        }
        f(&mut state)
    }
}

#[async_trait]
impl Session for MemorySession {
    fn id(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        self.with_state(|_| Ok(())).is_ok()
    }

    async fn enable_confirms(&self) -> Result<()> {
        self.with_state(|state| {
            if let Some(session) = state.sessions.get_mut(&self.id) {
                session.confirms = true;
            }
            Ok(())
        })
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.with_state(|state| {
            if let Some(session) = state.sessions.get_mut(&self.id) {
                session.prefetch = count;
            }
            Ok(())
        })
    }

    async fn declare_exchange(&self, declaration: &ExchangeDeclaration) -> Result<()> {
        self.with_state(|state| match state.exchanges.get(&declaration.name) {
            None if declaration.passive => Err(BusError::Topology(format!(
                "NOT_FOUND - no exchange '{}'",
                declaration.name
            ))),
            None => {
                state.exchanges.insert(
                    declaration.name.clone(),
                    ExchangeEntry {
                        kind: declaration.kind,
                        durable: declaration.durable,
                        auto_delete: declaration.auto_delete,
                    },
                );
                Ok(())
            }
            Some(_) if declaration.passive => Ok(()),
            Some(existing)
                if existing.kind != declaration.kind
                    || existing.durable != declaration.durable
                    || existing.auto_delete != declaration.auto_delete =>
            {
                Err(BusError::Topology(format!(
                    "PRECONDITION_FAILED - inequivalent arg for exchange '{}': received {} durable={}, current is {} durable={}",
                    declaration.name, declaration.kind, declaration.durable, existing.kind, existing.durable
                )))
            }
            Some(_) => Ok(()),
        })
    }

    async fn declare_queue(&self, name: &str) -> Result<()> {
        self.with_state(|state| {
            state.queues.entry(name.to_string()).or_default();
            Ok(())
        })
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.with_state(|state| {
            if !state.queues.contains_key(queue) {
                return Err(BusError::Topology(format!("NOT_FOUND - no queue '{}'", queue)));
            }
            if !state.exchanges.contains_key(exchange) {
                return Err(BusError::Topology(format!("NOT_FOUND - no exchange '{}'", exchange)));
            }
            let exists = state
                .bindings
                .iter()
                .any(|b| b.queue == queue && b.exchange == exchange && b.pattern == routing_key);
            if !exists {
                state.bindings.push(Binding {
                    exchange: exchange.to_string(),
                    queue: queue.to_string(),
                    pattern: routing_key.to_string(),
                });
            }
            Ok(())
        })
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let mut rx = self.with_state(|state| {
            if state.failing_consumes.remove(queue) {
                return Err(BusError::Consume(format!(
                    "failed to register a consumer: queue '{}' refused",
                    queue
                )));
            }
            if !state.queues.contains_key(queue) {
                return Err(BusError::Consume(format!("NOT_FOUND - no queue '{}'", queue)));
            }
            let reused = state
                .queues
                .values()
                .flat_map(|q| q.consumers.iter())
                .any(|c| c.session == self.id && c.tag == consumer_tag);
            if reused {
                return Err(BusError::Consume(format!(
                    "NOT_ALLOWED - attempt to reuse consumer tag '{}'",
                    consumer_tag
                )));
            }

            let (tx, rx) = mpsc::unbounded_channel();
            if let Some(entry) = state.queues.get_mut(queue) {
                entry.consumers.push(ConsumerEntry {
                    session: self.id,
                    tag: consumer_tag.to_string(),
                    tx,
                    in_flight: 0,
                });
            }
            dispatch(state, queue);
            Ok(rx)
        })?;

        Ok(Box::pin(futures::stream::poll_fn(move |cx| rx.poll_recv(cx))))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.with_state(|state| {
            for queue in state.queues.values_mut() {
                if let Some(index) = queue
                    .consumers
                    .iter()
                    .position(|c| c.session == self.id && c.tag == consumer_tag)
                {
                    queue.consumers.remove(index);
                    queue.cursor = 0;
                    return Ok(());
                }
            }
            Err(BusError::Consume(format!("unknown consumer tag '{}'", consumer_tag)))
        })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<PendingConfirm> {
        let outcome = self.with_state(|state| {
            if state.failing_publishes > 0 {
                state.failing_publishes -= 1;
                return Err(BusError::ChannelClosed("simulated channel closure".to_string()));
            }
            if !exchange.is_empty() && !state.exchanges.contains_key(exchange) {
                return Err(BusError::Publish(format!("NOT_FOUND - no exchange '{}'", exchange)));
            }

            enqueue(
                state,
                StoredMessage {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    body: message.body,
                    content_type: Some(message.content_type),
                    message_id: message.message_id,
                    redelivered: false,
                },
            );

            let confirms = state.sessions.get(&self.id).is_some_and(|s| s.confirms);
            Ok(match (confirms, state.confirm_mode) {
                (false, _) => Some(ConfirmOutcome::NotRequested),
                (true, ConfirmMode::Ack) => Some(ConfirmOutcome::Ack),
                (true, ConfirmMode::Nack) => Some(ConfirmOutcome::Nack),
                (true, ConfirmMode::Withhold) => None,
            })
        })?;

        let pending: PendingConfirm = match outcome {
            Some(outcome) => Box::pin(future::ready(Ok(outcome))),
            None => Box::pin(future::pending()),
        };
        Ok(pending)
    }

    async fn close(&self) -> Result<()> {
        if let Some(state) = self.state.upgrade() {
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            sever(&mut state, self.id, None);
        }
        Ok(())
    }
}

struct MemoryAcker {
    state: Weak<Mutex<BrokerState>>,
    session: u64,
    delivery_tag: u64,
}

impl MemoryAcker {
    fn settle(&self, disposition: Disposition) -> Result<()> {
        let state = self
            .state
            .upgrade()
            .ok_or_else(|| BusError::ChannelClosed("broker is gone".to_string()))?;
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.failing_acks {
            return Err(BusError::Ack("simulated acknowledgement failure".to_string()));
        }

        let session = state
            .sessions
            .get_mut(&self.session)
            .ok_or_else(|| BusError::ChannelClosed("channel is closed".to_string()))?;
        let session_name = session.name.clone();
        let unacked = session.unacked.remove(&self.delivery_tag).ok_or_else(|| {
            BusError::Ack(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                self.delivery_tag
            ))
        })?;

        if let Some(queue) = state.queues.get_mut(&unacked.queue) {
            if let Some(consumer) = queue
                .consumers
                .iter_mut()
                .find(|c| c.session == self.session && c.tag == unacked.consumer_tag)
            {
                consumer.in_flight = consumer.in_flight.saturating_sub(1);
            }
            if disposition == (Disposition::Nacked { requeue: true }) {
                let mut message = unacked.message.clone();
                message.redelivered = true;
                queue.ready.push_front(message);
            }
        }

        state.dispositions.push(DispositionRecord {
            queue: unacked.queue.clone(),
            routing_key: unacked.message.routing_key.clone(),
            message_id: unacked.message.message_id.clone(),
            session: session_name,
            disposition,
        });
        dispatch(&mut state, &unacked.queue);
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle(Disposition::Acked)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.settle(Disposition::Nacked { requeue })
    }
}

/// Routes a message into every bound queue. Returns how many queues took it.
fn enqueue(state: &mut BrokerState, message: StoredMessage) -> usize {
    let targets: BTreeSet<String> = if message.exchange.is_empty() {
        // Default exchange: routing key names the queue.
        state
            .queues
            .contains_key(&message.routing_key)
            .then(|| message.routing_key.clone())
            .into_iter()
            .collect()
    } else {
        let Some(kind) = state.exchanges.get(&message.exchange).map(|e| e.kind) else {
            return 0;
        };
        state
            .bindings
            .iter()
            .filter(|b| b.exchange == message.exchange)
            .filter(|b| match kind {
                ExchangeKind::Topic => topic_matches(&b.pattern, &message.routing_key),
                ExchangeKind::Direct => b.pattern == message.routing_key,
                ExchangeKind::Fanout => true,
            })
            .map(|b| b.queue.clone())
            .collect()
    };

    for queue in &targets {
        if let Some(entry) = state.queues.get_mut(queue) {
            entry.ready.push_back(message.clone());
        }
        dispatch(state, queue);
    }
    targets.len()
}

/// Hands ready messages to consumers with spare prefetch capacity, round robin.
fn dispatch(state: &mut BrokerState, queue_name: &str) {
    let BrokerState {
        this,
        queues,
        sessions,
        ..
    } = state;
    let Some(queue) = queues.get_mut(queue_name) else {
        return;
    };

    loop {
        if queue.ready.is_empty() || queue.consumers.is_empty() {
            return;
        }

        let count = queue.consumers.len();
        let chosen = (0..count)
            .map(|offset| (queue.cursor + offset) % count)
            .find(|&index| {
                let consumer = &queue.consumers[index];
                let prefetch = sessions.get(&consumer.session).map_or(0, |s| s.prefetch);
                prefetch == 0 || consumer.in_flight < usize::from(prefetch)
            });
        let Some(index) = chosen else {
            return;
        };
        let Some(message) = queue.ready.pop_front() else {
            return;
        };

        let consumer_session = queue.consumers[index].session;
        let Some(session) = sessions.get_mut(&consumer_session) else {
            queue.consumers.remove(index);
            queue.ready.push_front(message);
            queue.cursor = 0;
            continue;
        };
        let consumer = &mut queue.consumers[index];

        session.next_tag += 1;
        let delivery_tag = session.next_tag;
        let delivery = Delivery::new(
            InboundMessage {
                body: message.body.clone(),
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                delivery_tag,
                redelivered: message.redelivered,
                content_type: message.content_type.clone(),
                message_id: Some(message.message_id.clone()),
            },
            Box::new(MemoryAcker {
                state: this.clone(),
                session: consumer_session,
                delivery_tag,
            }),
        );

        if consumer.tx.send(Ok(delivery)).is_err() {
            // Subscriber went away without cancelling.
            queue.consumers.remove(index);
            queue.ready.push_front(message);
            queue.cursor = 0;
            continue;
        }

        consumer.in_flight += 1;
        session.unacked.insert(
            delivery_tag,
            Unacked {
                queue: queue_name.to_string(),
                consumer_tag: consumer.tag.clone(),
                message,
            },
        );
        queue.cursor = (index + 1) % count;
    }
}

/// Tears down a session: its consumers disappear (ending their streams) and
/// its unacked deliveries return to the head of their queues.
fn sever(state: &mut BrokerState, id: u64, reason: Option<&str>) {
    let Some(mut session) = state.sessions.remove(&id) else {
        return;
    };

    for queue in state.queues.values_mut() {
        queue.consumers.retain(|c| c.session != id);
        queue.cursor = 0;
    }

    let mut touched = BTreeSet::new();
    for (_, unacked) in std::mem::take(&mut session.unacked).into_iter().rev() {
        if let Some(queue) = state.queues.get_mut(&unacked.queue) {
            let mut message = unacked.message;
            message.redelivered = true;
            queue.ready.push_front(message);
            touched.insert(unacked.queue);
        }
    }

    if let (Some(tx), Some(reason)) = (session.lost_tx.take(), reason) {
        let _ = tx.send(reason.to_string());
    }
    debug!(session = %session.name, "Memory broker closed a connection");

    for queue in touched {
        dispatch(state, &queue);
    }
}
