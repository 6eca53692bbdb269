use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{Mutex, mpsc};

use crate::broker::Broker;
use crate::handler::{Handler, Outcome};
use crate::message::Delivery;
use crate::middleware::{Middleware, WorkerSignal};

#[derive(Clone)]
pub(crate) struct ExecutorContext {
    pub(crate) broker: Broker,
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) middleware: Arc<[Arc<dyn Middleware>]>,
    pub(crate) signal: WorkerSignal,
    pub(crate) restart_nacks: bool,
}

/// One executor's main loop: take the next dispatched message, run it, and
/// settle it with the broker. A message already taken is always finished
/// first, but once the worker starts draining no further message is taken,
/// even one already sitting in the hand-off channel.
pub(crate) async fn run(
    executor_id: usize,
    ctx: ExecutorContext,
    rx: Arc<Mutex<mpsc::Receiver<Delivery>>>,
) {
    loop {
        let delivery = {
            let mut rx = rx.lock().await;
            tokio::select! {
                biased;
                _ = ctx.signal.drain_token().cancelled() => None,
                delivery = rx.recv() => delivery,
            }
        };
        let Some(delivery) = delivery else { break };
        process_one(&ctx, delivery).await;
    }
    tracing::debug!(executor_id, "Executor stopped");
}

async fn process_one(ctx: &ExecutorContext, delivery: Delivery) {
    for middleware in ctx.middleware.iter() {
        middleware
            .before_process_message(&ctx.signal, &delivery)
            .await;
    }

    tracing::info!(
        message_id = delivery.id,
        queue = delivery.queue,
        priority = delivery.priority,
        "Message started"
    );
    let start = std::time::Instant::now();

    // Run the task and contain panics; a panicking handler is a terminal
    // failure, not a worker crash.
    let outcome = match AssertUnwindSafe(ctx.handler.process(&delivery))
        .catch_unwind()
        .await
    {
        Ok(outcome) => outcome,
        Err(panic) => {
            let panic_msg = if let Some(s) = panic.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic occurred".to_string()
            };
            Outcome::Terminal(panic_msg.into())
        }
    };

    let duration = start.elapsed();
    tracing::info!(
        message_id = delivery.id,
        queue = delivery.queue,
        success = outcome.is_success(),
        duration = duration.as_millis() as u64,
        "Message finished"
    );

    match &outcome {
        Outcome::Success => ack(ctx, &delivery).await,
        Outcome::Retryable(err) => {
            tracing::warn!(
                message_id = delivery.id,
                queue = delivery.queue,
                error = %err,
                "Message failed; leaving it to the retry policy"
            );
        }
        Outcome::Terminal(err) => {
            tracing::error!(
                message_id = delivery.id,
                queue = delivery.queue,
                error = %err,
                "Message failed terminally"
            );
            nack(ctx, &delivery).await;
        }
        Outcome::RestartRequested => {
            if ctx.restart_nacks {
                nack(ctx, &delivery).await;
            } else {
                ack(ctx, &delivery).await;
            }
        }
    }

    ctx.signal.record_processed();
    for middleware in ctx.middleware.iter() {
        middleware
            .after_process_message(&ctx.signal, &delivery, &outcome)
            .await;
    }
}

async fn ack(ctx: &ExecutorContext, delivery: &Delivery) {
    if let Err(err) = ctx.broker.ack(&delivery.queue, &delivery.id).await {
        tracing::error!(
            message_id = delivery.id,
            queue = delivery.queue,
            error = %err,
            "Failed to ack message"
        );
    }
}

async fn nack(ctx: &ExecutorContext, delivery: &Delivery) {
    if let Err(err) = ctx.broker.nack(&delivery.queue, &delivery.id).await {
        tracing::error!(
            message_id = delivery.id,
            queue = delivery.queue,
            error = %err,
            "Failed to dead-letter message"
        );
    }
}
