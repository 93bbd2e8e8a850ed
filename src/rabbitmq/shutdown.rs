// src/rabbitmq/shutdown.rs
//! Process-wide cancellation plus a wait-group over in-flight work.
//!
//! The signal is raised once, either by the host (OS signal) or by the
//! connection manager when reconnecting fails, and is never reset. Listener
//! loops are spawned on the tracker; publishes hold an [`InFlight`] guard for
//! their duration. [`ShutdownCoordinator::wait`] returns once the signal has
//! been raised and every tracked operation has completed.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use super::errors::{BusError, Result};

#[derive(Clone, Default)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    token: CancellationToken,
    tracker: TaskTracker,
    fatal: Mutex<Option<String>>,
}

/// Keeps the coordinator from completing `wait` while held.
pub struct InFlight {
    _token: TaskTrackerToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle on the shutdown signal, for host code that selects on it.
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// Raises the shutdown signal. Idempotent.
    pub fn signal(&self) {
        if !self.inner.token.is_cancelled() {
            info!(in_flight = self.inner.tracker.len(), "Shutdown signal raised");
        }
        self.inner.token.cancel();
        self.inner.tracker.close();
    }

    pub fn is_raised(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    pub async fn raised(&self) {
        self.inner.token.cancelled().await
    }

    /// Records an unrecoverable error and raises the signal. The first
    /// recorded error wins.
    pub fn raise_fatal(&self, reason: impl Into<String>) {
        let reason = reason.into();
        error!(reason = %reason, "RabbitMQ: fatal error, shutting down");
        {
            let mut fatal = self.inner.fatal.lock().unwrap_or_else(PoisonError::into_inner);
            fatal.get_or_insert(reason);
        }
        self.signal();
    }

    pub fn fatal_error(&self) -> Option<BusError> {
        self.inner
            .fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .map(BusError::Fatal)
    }

    /// Spawns a task that `wait` will join.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.tracker.spawn(task)
    }

    /// Registers one in-flight operation, failing fast once the signal is up.
    pub fn begin_operation(&self) -> Result<InFlight> {
        if self.is_raised() {
            return Err(BusError::ShuttingDown);
        }
        Ok(InFlight {
            _token: self.inner.tracker.token(),
        })
    }

    /// Tracked tasks and operations that have not completed yet.
    pub fn in_flight(&self) -> usize {
        self.inner.tracker.len()
    }

    /// Blocks until the signal is raised and all tracked work has drained.
    /// Returns the fatal error if the shutdown was caused by one.
    pub async fn wait(&self) -> Result<()> {
        self.inner.token.cancelled().await;
        self.inner.tracker.close();
        debug!(in_flight = self.inner.tracker.len(), "Waiting for in-flight operations to drain");
        self.inner.tracker.wait().await;

        match self.fatal_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
