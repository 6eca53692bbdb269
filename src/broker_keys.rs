/// Centralizes the Redis key naming scheme used by the dispatch script and
/// the read-only inspection helpers.
#[derive(Clone)]
pub(crate) struct BrokerKeys {
    /// Namespace prefix applied to every Redis key (e.g. `dramatiq`).
    pub(crate) namespace: String,
    /// Redis sorted set (ZSET) of worker ids scored by their last heartbeat
    /// in epoch milliseconds.
    pub(crate) heartbeats: String,
}

impl BrokerKeys {
    pub(crate) fn new(namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            heartbeats: format!("{namespace}:__heartbeats__"),
            namespace,
        }
    }

    /// Sorted set of enqueued, unfetched message ids, scored by priority.
    pub(crate) fn queue(&self, queue: &str) -> String {
        format!("{}:{}", self.namespace, queue)
    }

    /// Hash of message id to payload. A message id lives here for as long as
    /// it sits in the queue zset or in some worker's ack group.
    pub(crate) fn queue_messages(&self, queue: &str) -> String {
        format!("{}:{}.msgs", self.namespace, queue)
    }

    /// Sorted set of message ids currently in flight on `worker_id` for
    /// `queue`, scored by the priority each message had at fetch time.
    pub(crate) fn ack_group(&self, worker_id: &str, queue: &str) -> String {
        format!("{}:__acks__.{}.{}", self.namespace, worker_id, queue)
    }

    /// Dead-letter zset for the canonical queue, scored by dead-letter time
    /// in epoch milliseconds.
    pub(crate) fn dead_letter_queue(&self, queue: &str) -> String {
        format!("{}:{}.XQ", self.namespace, canonical_queue(queue))
    }

    /// Hash mirroring payloads for dead-lettered message ids.
    pub(crate) fn dead_letter_messages(&self, queue: &str) -> String {
        format!("{}:{}.XQ.msgs", self.namespace, canonical_queue(queue))
    }
}

/// Strips the delayed-queue suffix so `Q.DQ` shares `Q`'s dead-letter keys.
pub(crate) fn canonical_queue(queue: &str) -> &str {
    queue.strip_suffix(".DQ").unwrap_or(queue)
}
