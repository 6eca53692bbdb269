use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backoff::compute_backoff;
use crate::broker::Broker;
use crate::error::PriqError;
use crate::message::Delivery;

/// Streams one queue's messages into a bounded in-memory buffer, one
/// consumer per (worker, queue) pair. The buffer never holds more than
/// `prefetch` messages; a refill happens only once it has drained below
/// half, and an empty queue is polled with exponential backoff.
///
/// Each buffered message is already in this worker's ack group, so whoever
/// takes a message from the consumer owns its ack or nack.
pub struct Consumer {
    queue: String,
    broker: Broker,
    rx: mpsc::Receiver<Delivery>,
    shutdown: CancellationToken,
    fetcher: JoinHandle<()>,
}

impl Consumer {
    pub(crate) fn spawn(broker: Broker, queue: String, prefetch: usize) -> Self {
        let prefetch = prefetch.max(1);
        let (tx, rx) = mpsc::channel(prefetch);
        let shutdown = CancellationToken::new();
        let fetcher = tokio::spawn(fetch_loop(
            broker.clone(),
            queue.clone(),
            prefetch,
            tx,
            shutdown.clone(),
        ));
        Self {
            queue,
            broker,
            rx,
            shutdown,
            fetcher,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Waits for the next buffered message. Returns `None` once the consumer
    /// is shut down and drained.
    pub async fn next_message(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    pub(crate) fn try_next(&mut self) -> Option<Delivery> {
        self.rx.try_recv().ok()
    }

    /// Stops fetching and requeues every message still buffered but never
    /// handed out, restoring each at the priority it was fetched with.
    pub async fn close(mut self) -> Result<(), PriqError> {
        self.shutdown.cancel();
        if let Err(err) = self.fetcher.await {
            tracing::error!(queue = self.queue, error = %err, "Consumer fetch task panicked");
        }
        self.rx.close();

        let mut pending = Vec::new();
        while let Ok(delivery) = self.rx.try_recv() {
            pending.push((delivery.id, delivery.priority));
        }
        if !pending.is_empty() {
            tracing::info!(
                queue = self.queue,
                count = pending.len(),
                "Requeueing undispatched messages"
            );
            self.broker.requeue_batch(&self.queue, &pending).await?;
        }
        Ok(())
    }
}

async fn fetch_loop(
    broker: Broker,
    queue: String,
    prefetch: usize,
    tx: mpsc::Sender<Delivery>,
    shutdown: CancellationToken,
) {
    let min_refresh = broker.config().min_refresh;
    let max_backoff = broker.config().max_backoff;
    let mut misses = 0u32;
    let mut delay = Duration::ZERO;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let free = tx.capacity();
        let buffered = prefetch - free;
        if buffered * 2 >= prefetch {
            delay = min_refresh;
            continue;
        }

        match broker.fetch(&queue, free).await {
            Ok(deliveries) if !deliveries.is_empty() => {
                misses = 0;
                delay = min_refresh;
                let mut deliveries = deliveries.into_iter();
                while let Some(delivery) = deliveries.next() {
                    // Only this task sends, and it never fetches more than
                    // the channel has room for, so a failure here means the
                    // receiver is gone. Put everything back rather than wait
                    // for crash recovery.
                    if let Err(err) = tx.try_send(delivery) {
                        let delivery = match err {
                            mpsc::error::TrySendError::Full(delivery)
                            | mpsc::error::TrySendError::Closed(delivery) => delivery,
                        };
                        let mut pending = vec![(delivery.id, delivery.priority)];
                        pending.extend(deliveries.map(|d| (d.id, d.priority)));
                        if let Err(err) = broker.requeue_batch(&queue, &pending).await {
                            tracing::error!(
                                queue,
                                count = pending.len(),
                                error = %err,
                                "Failed to requeue after losing the consumer receiver"
                            );
                        }
                        return;
                    }
                }
            }
            Ok(_) => {
                delay = compute_backoff(misses, min_refresh, max_backoff);
                misses = misses.saturating_add(1);
            }
            Err(err) => {
                tracing::warn!(queue, error = %err, "Fetch failed");
                delay = compute_backoff(misses, min_refresh, max_backoff);
                misses = misses.saturating_add(1);
            }
        }
    }
}
