// src/rabbitmq/listener.rs
//! One delivery loop per subscription.
//!
//! A listener moves through three states:
//!
//! * `Running`: every delivery goes to the handler, in broker order. Success
//!   acks the delivery; a handler error nacks it without requeue. A failed
//!   nack means the channel is broken and stops the loop; a failed ack is
//!   only logged. A handler that failed only because shutdown refused its
//!   work leaves the delivery unsettled, so the broker redelivers it once
//!   the channel closes.
//! * `Draining`: entered when the shutdown signal is raised. The
//!   subscription is cancelled and the deliveries already buffered locally
//!   are still processed.
//! * `Stopped`: the delivery stream ended, or the channel handle is no
//!   longer connected.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use tracing::{debug, error, info, warn};

use super::broker::{Delivery, DeliveryStream, Session};
use super::consumer::MessageHandler;
use super::errors::{BusError, Result};
use super::shutdown::ShutdownCoordinator;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenerState {
    Running,
    Draining,
    Stopped,
}

enum Step {
    Shutdown,
    Next(Option<Result<Delivery>>),
}

pub(crate) struct Listener {
    queue: String,
    session: Arc<dyn Session>,
    deliveries: DeliveryStream,
    handler: Arc<dyn MessageHandler>,
    shutdown: ShutdownCoordinator,
    state: ListenerState,
}

impl Listener {
    pub(crate) fn new(
        queue: String,
        session: Arc<dyn Session>,
        deliveries: DeliveryStream,
        handler: Arc<dyn MessageHandler>,
        shutdown: ShutdownCoordinator,
    ) -> Self {
        Self {
            queue,
            session,
            deliveries,
            handler,
            shutdown,
            state: ListenerState::Running,
        }
    }

    /// Runs until `Stopped` and returns the final state.
    pub(crate) async fn run(mut self) -> ListenerState {
        debug!(queue = %self.queue, session = %self.session.id(), "Listener started");

        while self.state != ListenerState::Stopped {
            let step = match self.state {
                ListenerState::Running => {
                    tokio::select! {
                        biased;
                        _ = self.shutdown.raised() => Step::Shutdown,
                        next = self.deliveries.next() => Step::Next(next),
                    }
                }
                _ => Step::Next(self.deliveries.next().await),
            };

            match step {
                Step::Shutdown => self.drain().await,
                Step::Next(None) => self.transition(ListenerState::Stopped),
                Step::Next(Some(Err(err))) => {
                    warn!(queue = %self.queue, error = %err, "Error receiving delivery");
                }
                Step::Next(Some(Ok(delivery))) => {
                    if !self.session.is_connected() {
                        // Left unsettled; the broker redelivers it on the next subscription.
                        self.transition(ListenerState::Stopped);
                        break;
                    }
                    self.process(delivery).await;
                }
            }

            if self.state != ListenerState::Stopped && !self.session.is_connected() {
                self.transition(ListenerState::Stopped);
            }
        }

        debug!(queue = %self.queue, "Listener stopped");
        self.state
    }

    async fn drain(&mut self) {
        self.transition(ListenerState::Draining);
        if let Err(err) = self.session.cancel(&self.queue).await {
            warn!(queue = %self.queue, error = %err, "Failed to cancel subscription");
            self.transition(ListenerState::Stopped);
        }
    }

    async fn process(&mut self, delivery: Delivery) {
        let message = delivery.message().clone();
        let outcome = AssertUnwindSafe(self.handler.handle(message.clone()))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(anyhow::anyhow!("handler panicked")));

        match outcome {
            Ok(()) => {
                if let Err(err) = delivery.ack().await {
                    warn!(
                        queue = %self.queue,
                        delivery_tag = message.delivery_tag,
                        error = %err,
                        "Failed to acknowledge message"
                    );
                }
            }
            Err(err) if interrupted_by_shutdown(&err) => {
                info!(
                    queue = %self.queue,
                    delivery_tag = message.delivery_tag,
                    "Shutdown in progress, leaving message for redelivery"
                );
            }
            Err(err) => {
                warn!(
                    queue = %self.queue,
                    routing_key = %message.routing_key,
                    error = %err,
                    "Handler failed, dropping message"
                );
                if let Err(err) = delivery.nack(false).await {
                    error!(
                        queue = %self.queue,
                        delivery_tag = message.delivery_tag,
                        error = %err,
                        "Failed to negatively acknowledge message"
                    );
                    self.transition(ListenerState::Stopped);
                }
            }
        }
    }

    fn transition(&mut self, next: ListenerState) {
        if self.state != next {
            debug!(queue = %self.queue, from = ?self.state, to = ?next, "Listener state changed");
            self.state = next;
        }
    }
}

fn interrupted_by_shutdown(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| matches!(cause.downcast_ref::<BusError>(), Some(BusError::ShuttingDown)))
}
