use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broker::Broker;
use crate::consumer::Consumer;
use crate::message::Delivery;

const IDLE_POLL: Duration = Duration::from_millis(25);

/// Round-robins ready messages from the consumers into the executors'
/// hand-off channel, skipping consumers with nothing buffered. Returns the
/// consumers on shutdown so the worker can close them and requeue whatever
/// is still buffered.
pub(crate) async fn run(
    broker: Broker,
    mut consumers: Vec<Consumer>,
    tx: mpsc::Sender<Delivery>,
    shutdown: CancellationToken,
) -> Vec<Consumer> {
    let mut cursor = 0usize;

    'outer: while !shutdown.is_cancelled() {
        let mut ready = None;
        for _ in 0..consumers.len() {
            let index = cursor % consumers.len();
            cursor = cursor.wrapping_add(1);
            let Some(consumer) = consumers.get_mut(index) else {
                continue;
            };
            if let Some(delivery) = consumer.try_next() {
                ready = Some(delivery);
                break;
            }
        }

        let Some(delivery) = ready else {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(IDLE_POLL) => {}
            }
            continue;
        };

        // Hand off, waiting for an executor to free up. A message taken out
        // of its consumer must not be dropped on shutdown, so it is requeued
        // here if no executor will ever take it.
        tokio::select! {
            _ = shutdown.cancelled() => {
                requeue_one(&broker, delivery).await;
                break 'outer;
            }
            permit = tx.reserve() => match permit {
                Ok(permit) => permit.send(delivery),
                Err(_) => {
                    requeue_one(&broker, delivery).await;
                    break 'outer;
                }
            }
        }
    }

    consumers
}

async fn requeue_one(broker: &Broker, delivery: Delivery) {
    let queue = delivery.queue.clone();
    if let Err(err) = broker
        .requeue_batch(&queue, &[(delivery.id, delivery.priority)])
        .await
    {
        tracing::error!(queue, error = %err, "Failed to requeue undispatched message");
    }
}
