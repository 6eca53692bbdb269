use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::broker::Broker;
use crate::consumer::Consumer;
use crate::dispatcher;
use crate::error::PriqError;
use crate::executor::{self, ExecutorContext};
use crate::handler::Handler;
use crate::message::Delivery;
use crate::middleware::{MaxTasksPerChild, Middleware, RestartOnRequest, WorkerSignal};

/// Exit code returned by [`Worker::run`] when the process asked for its own
/// restart. Supervisors should relaunch on it; any other nonzero exit is
/// abnormal.
pub const RESTART_EXIT_CODE: i32 = 3;

/// Process-level coordinator: owns the consumers (one per subscribed
/// queue), the executor pool, the middleware chain, and the restart state
/// machine. A worker runs until a shutdown signal or a restart request,
/// drains, and reports the exit code for the host binary to pass to
/// `std::process::exit`.
pub struct Worker {
    broker: Broker,
    handler: Arc<dyn Handler>,
    middleware: Vec<Arc<dyn Middleware>>,
    queues: Vec<String>,
    exit_when_processed: Option<u64>,
    shutdown_signal: Pin<Box<dyn Future<Output = Result<(), std::io::Error>> + Send + Sync>>,
}

impl Worker {
    pub fn new(broker: Broker, handler: impl Handler + 'static) -> Self {
        Self {
            broker,
            handler: Arc::new(handler),
            middleware: Vec::new(),
            queues: Vec::new(),
            exit_when_processed: None,
            shutdown_signal: Box::pin(default_shutdown_signal()),
        }
    }

    /// Adds a queue to consume from. Subscribing twice is a no-op.
    pub fn subscribe(mut self, queue: impl Into<String>) -> Self {
        let queue = queue.into();
        if !self.queues.contains(&queue) {
            self.queues.push(queue);
        }
        self
    }

    /// Appends a middleware to the chain. The restart middlewares are
    /// installed automatically; this is for anything beyond them.
    pub fn middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Drains and exits cleanly after this many processed messages. Meant
    /// for tests and batch-style invocations.
    pub fn exit_when_processed(mut self, processed: u64) -> Self {
        self.exit_when_processed = Some(processed);
        self
    }

    /// Replaces the default SIGINT/SIGTERM shutdown trigger.
    pub fn with_graceful_shutdown(
        mut self,
        fut: impl Future<Output = Result<(), std::io::Error>> + Send + Sync + 'static,
    ) -> Self {
        self.shutdown_signal = Box::pin(fut);
        self
    }

    pub async fn run(mut self) -> Result<i32, PriqError> {
        if self.queues.is_empty() {
            return Err(PriqError::Config(
                "worker needs at least one subscribed queue".to_string(),
            ));
        }

        let config = self.broker.config().clone();
        let executors = config.executors.max(1);
        let prefetch = config.effective_prefetch();

        let drain = CancellationToken::new();
        let signal = WorkerSignal::new(drain.clone(), self.exit_when_processed);

        let mut middleware: Vec<Arc<dyn Middleware>> = Vec::new();
        if config.max_tasks_per_child > 0 {
            middleware.push(Arc::new(MaxTasksPerChild::new(config.max_tasks_per_child)));
        }
        middleware.push(Arc::new(RestartOnRequest));
        middleware.append(&mut self.middleware);
        let middleware: Arc<[Arc<dyn Middleware>]> = middleware.into();

        let consumers: Vec<Consumer> = self
            .queues
            .iter()
            .map(|queue| self.broker.consume(queue.clone(), prefetch))
            .collect();

        let (work_tx, work_rx) = mpsc::channel::<Delivery>(1);
        let work_rx = Arc::new(Mutex::new(work_rx));

        let dispatcher = tokio::spawn(dispatcher::run(
            self.broker.clone(),
            consumers,
            work_tx,
            drain.clone(),
        ));

        let ctx = ExecutorContext {
            broker: self.broker.clone(),
            handler: Arc::clone(&self.handler),
            middleware: Arc::clone(&middleware),
            signal: signal.clone(),
            restart_nacks: config.restart_nacks,
        };
        let mut executor_set = JoinSet::new();
        for executor_id in 0..executors {
            executor_set.spawn(executor::run(executor_id, ctx.clone(), Arc::clone(&work_rx)));
        }

        tracing::info!(
            worker_id = self.broker.worker_id(),
            host = %gethostname::gethostname().to_string_lossy(),
            queues = ?self.queues,
            executors,
            prefetch,
            "Worker started"
        );

        tokio::select! {
            result = &mut self.shutdown_signal => {
                if let Err(err) = result {
                    tracing::error!(error = %err, "Shutdown signal failed");
                }
                tracing::info!("Shutdown signal received; draining worker");
                drain.cancel();
            }
            _ = drain.cancelled() => {}
        }

        // Drain: stop dispatching, return buffered messages to the queue,
        // and let executors finish the message they already hold. Past the
        // grace deadline, in-flight messages are abandoned to crash
        // recovery.
        let graceful = tokio::time::timeout(config.shutdown_grace, async {
            let consumers = dispatcher.await?;
            for consumer in consumers {
                if let Err(err) = consumer.close().await {
                    tracing::error!(error = %err, "Failed to drain consumer");
                }
            }
            while executor_set.join_next().await.is_some() {}

            // A message can be stranded in the hand-off channel when
            // executors stop taking work mid-drain.
            let mut work_rx = work_rx.lock().await;
            work_rx.close();
            while let Ok(delivery) = work_rx.try_recv() {
                if let Err(err) = self
                    .broker
                    .requeue_batch(&delivery.queue, &[(delivery.id, delivery.priority)])
                    .await
                {
                    tracing::error!(error = %err, "Failed to requeue stranded message");
                }
            }
            Ok::<(), PriqError>(())
        })
        .await;

        match graceful {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::error!(error = %err, "Worker drain failed"),
            Err(_) => {
                tracing::warn!(
                    grace_ms = config.shutdown_grace.as_millis() as u64,
                    "Shutdown grace exceeded; abandoning in-flight messages to crash recovery"
                );
                executor_set.abort_all();
            }
        }

        for middleware in middleware.iter() {
            middleware.before_worker_shutdown(&signal).await;
        }

        let exit_code = if signal.restart_pending() {
            RESTART_EXIT_CODE
        } else {
            0
        };
        tracing::info!(
            exit_code,
            processed = signal.messages_processed(),
            "Worker stopped"
        );
        Ok(exit_code)
    }
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
async fn default_shutdown_signal() -> Result<(), std::io::Error> {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = ctrl_c => Ok(()),
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(target_os = "windows")]
async fn default_shutdown_signal() -> Result<(), std::io::Error> {
    tokio::signal::ctrl_c().await
}
