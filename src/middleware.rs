use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::handler::Outcome;
use crate::message::Delivery;

struct SignalShared {
    restart_pending: AtomicBool,
    processed: AtomicU64,
    processed_target: Option<u64>,
    drain: CancellationToken,
}

/// Handle through which middleware and executors observe and steer the
/// owning worker: a monotone processed counter, a one-shot restart flag, and
/// the drain broadcast. Cloning is cheap and all clones share state.
#[derive(Clone)]
pub struct WorkerSignal {
    shared: Arc<SignalShared>,
}

impl WorkerSignal {
    pub(crate) fn new(drain: CancellationToken, processed_target: Option<u64>) -> Self {
        Self {
            shared: Arc::new(SignalShared {
                restart_pending: AtomicBool::new(false),
                processed: AtomicU64::new(0),
                processed_target,
                drain,
            }),
        }
    }

    /// Asks the worker to drain and exit with the restart code. Idempotent;
    /// only the first call transitions the worker.
    pub fn request_restart(&self) {
        if !self.shared.restart_pending.swap(true, Ordering::SeqCst) {
            tracing::info!("Restart requested; worker will drain and exit");
            self.shared.drain.cancel();
        }
    }

    pub fn restart_pending(&self) -> bool {
        self.shared.restart_pending.load(Ordering::SeqCst)
    }

    pub fn messages_processed(&self) -> u64 {
        self.shared.processed.load(Ordering::SeqCst)
    }

    pub(crate) fn drain_token(&self) -> &CancellationToken {
        &self.shared.drain
    }

    pub(crate) fn record_processed(&self) -> u64 {
        let count = self.shared.processed.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(target) = self.shared.processed_target
            && count >= target
        {
            self.shared.drain.cancel();
        }
        count
    }
}

/// Worker lifecycle hooks. Every method is a no-op by default; implementors
/// override the events they care about. The event set is fixed, there is no
/// dynamic hook registration.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn before_process_message(&self, _signal: &WorkerSignal, _delivery: &Delivery) {}

    async fn after_process_message(
        &self,
        _signal: &WorkerSignal,
        _delivery: &Delivery,
        _outcome: &Outcome,
    ) {
    }

    async fn before_worker_shutdown(&self, _signal: &WorkerSignal) {}
}

/// Requests a worker restart after a fixed number of completed messages,
/// counting every processed message regardless of outcome. The counter is
/// per process and resets to zero on relaunch.
pub struct MaxTasksPerChild {
    limit: u64,
    counter: Mutex<u64>,
}

impl MaxTasksPerChild {
    /// `limit` of 0 disables the middleware.
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            counter: Mutex::new(0),
        }
    }
}

#[async_trait]
impl Middleware for MaxTasksPerChild {
    async fn after_process_message(
        &self,
        signal: &WorkerSignal,
        _delivery: &Delivery,
        _outcome: &Outcome,
    ) {
        if self.limit == 0 {
            return;
        }
        let mut counter = self
            .counter
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *counter += 1;
        if *counter >= self.limit {
            tracing::info!(
                limit = self.limit,
                "Task limit per child reached; requesting worker restart"
            );
            signal.request_restart();
        }
    }
}

/// Surfaces [`Outcome::RestartRequested`] raised by task code: a task that
/// wants its process recycled (say, after a memory-bloating operation)
/// returns that outcome and this middleware flips the worker into draining.
pub struct RestartOnRequest;

#[async_trait]
impl Middleware for RestartOnRequest {
    async fn after_process_message(
        &self,
        signal: &WorkerSignal,
        delivery: &Delivery,
        outcome: &Outcome,
    ) {
        if matches!(outcome, Outcome::RestartRequested) {
            tracing::info!(
                message_id = delivery.id,
                queue = delivery.queue,
                "Task requested worker restart"
            );
            signal.request_restart();
        }
    }
}
