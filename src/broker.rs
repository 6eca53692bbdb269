use std::sync::Arc;
use std::time::Duration;

use deadpool_redis::redis::{self, AsyncCommands, FromRedisValue, ScriptInvocation};
use rand::Rng;
use uuid::Uuid;

use crate::backoff::compute_backoff;
use crate::broker_keys::BrokerKeys;
use crate::config::Config;
use crate::consumer::Consumer;
use crate::error::PriqError;
use crate::message::{Delivery, Message, MessageId};
use crate::script::dispatch_script;

const MAX_DISPATCH_ATTEMPTS: u32 = 6;
const RETRY_MIN_BACKOFF: Duration = Duration::from_millis(50);
const RETRY_MAX_BACKOFF: Duration = Duration::from_millis(2_000);

/// Process-local client for the Redis-resident broker. One instance per
/// process: the worker id minted at construction identifies every in-flight
/// message this process holds, and all consumers and executors share it.
/// Cloning is cheap.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    pool: deadpool_redis::Pool,
    keys: BrokerKeys,
    script: redis::Script,
    worker_id: String,
    config: Config,
}

impl Broker {
    pub fn new(pool: deadpool_redis::Pool, config: Config) -> Result<Self, PriqError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(BrokerInner {
                pool,
                keys: BrokerKeys::new(config.namespace.clone()),
                script: dispatch_script(),
                worker_id: Uuid::new_v4().to_string(),
                config,
            }),
        })
    }

    pub fn from_url(url: impl AsRef<str>, config: Config) -> Result<Self, PriqError> {
        let pool = deadpool_redis::Config::from_url(url.as_ref())
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))?;
        Self::new(pool, config)
    }

    /// Stable identity of this process across all its consumers, minted once
    /// at construction.
    pub fn worker_id(&self) -> &str {
        &self.inner.worker_id
    }

    pub fn namespace(&self) -> &str {
        &self.inner.keys.namespace
    }

    pub(crate) fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Enqueues a payload at the configured default priority.
    pub async fn enqueue(
        &self,
        queue: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Result<MessageId, PriqError> {
        let priority = self.inner.config.default_priority;
        self.enqueue_message(&Message::new(queue, payload, priority))
            .await
    }

    /// Enqueues a payload at an explicit priority. Lower runs first.
    pub async fn enqueue_with_priority(
        &self,
        queue: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        priority: i64,
    ) -> Result<MessageId, PriqError> {
        self.enqueue_message(&Message::new(queue, payload, priority))
            .await
    }

    /// Enqueues a fully specified message. Enqueueing an id that already
    /// exists replaces its payload and priority.
    pub async fn enqueue_message(&self, message: &Message) -> Result<MessageId, PriqError> {
        tracing::debug!(
            message_id = message.id,
            queue = message.queue,
            priority = message.priority,
            "Enqueueing message"
        );
        self.dispatch::<String>("enqueue", &message.queue, |invocation| {
            invocation
                .arg(&message.id)
                .arg(&message.payload)
                .arg(message.priority);
        })
        .await
    }

    /// Pops up to `count` messages in ascending priority order, moving each
    /// into this worker's ack group. Every returned delivery must eventually
    /// be acked, nacked, or requeued; a worker crash hands them to
    /// maintenance instead.
    pub async fn fetch(&self, queue: &str, count: usize) -> Result<Vec<Delivery>, PriqError> {
        let reply = self
            .dispatch::<redis::Value>("fetch", queue, |invocation| {
                invocation.arg(count);
            })
            .await?;

        let (meta, payloads): (Vec<String>, Vec<Vec<u8>>) = redis::from_redis_value(&reply)
            .map_err(|err| PriqError::Protocol(format!("unexpected fetch reply: {err}")))?;
        if meta.len() != payloads.len() * 2 {
            return Err(PriqError::Protocol(format!(
                "fetch reply metadata and payloads disagree: {} ids for {} payloads",
                meta.len() / 2,
                payloads.len()
            )));
        }

        let mut meta = meta.into_iter();
        let mut deliveries = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let (Some(id), Some(score)) = (meta.next(), meta.next()) else {
                return Err(PriqError::Protocol(
                    "fetch reply metadata ended early".to_string(),
                ));
            };
            let priority = score
                .parse::<f64>()
                .map_err(|_| PriqError::Protocol(format!("unparseable priority score: {score}")))?
                as i64;
            deliveries.push(Delivery {
                id,
                queue: queue.to_string(),
                priority,
                payload,
            });
        }
        Ok(deliveries)
    }

    /// Acknowledges a delivery, deleting it for good. Idempotent; acking a
    /// message this worker no longer holds is a no-op.
    pub async fn ack(&self, queue: &str, message_id: &str) -> Result<(), PriqError> {
        tracing::debug!(message_id, queue, "Acking message");
        let _: i64 = self
            .dispatch("ack", queue, |invocation| {
                invocation.arg(message_id);
            })
            .await?;
        Ok(())
    }

    /// Rejects a delivery, moving it to the canonical queue's dead-letter
    /// queue.
    pub async fn nack(&self, queue: &str, message_id: &str) -> Result<(), PriqError> {
        tracing::debug!(message_id, queue, "Dead-lettering message");
        let _: i64 = self
            .dispatch("nack", queue, |invocation| {
                invocation.arg(message_id);
            })
            .await?;
        Ok(())
    }

    /// Returns in-flight deliveries to the queue at the priorities they were
    /// fetched with. Entries this worker no longer holds, or whose payload is
    /// already gone, are skipped. Returns how many were restored.
    pub async fn requeue_batch(
        &self,
        queue: &str,
        entries: &[(MessageId, i64)],
    ) -> Result<usize, PriqError> {
        if entries.is_empty() {
            return Ok(0);
        }
        let requeued: i64 = self
            .dispatch("requeue", queue, |invocation| {
                for (message_id, priority) in entries {
                    invocation.arg(message_id).arg(*priority);
                }
            })
            .await?;
        Ok(requeued as usize)
    }

    /// Deletes the queue, its payloads, this worker's ack group, and the
    /// dead-letter mirrors.
    pub async fn purge(&self, queue: &str) -> Result<(), PriqError> {
        tracing::debug!(queue, "Purging queue");
        let _: i64 = self.dispatch("purge", queue, |_| {}).await?;
        Ok(())
    }

    /// Message count visible to this worker: stored payloads plus this
    /// worker's in-flight messages. Intended for tests and diagnostics.
    pub async fn qsize(&self, queue: &str) -> Result<usize, PriqError> {
        let size: i64 = self.dispatch("qsize", queue, |_| {}).await?;
        Ok(size as usize)
    }

    /// Starts a consumer streaming this queue into a bounded local buffer.
    pub fn consume(&self, queue: impl Into<String>, prefetch: usize) -> Consumer {
        Consumer::spawn(self.clone(), queue.into(), prefetch)
    }

    /// Current dead-letter contents for a queue. Read-only; bypasses the
    /// dispatch script.
    pub async fn dead_letters(
        &self,
        queue: &str,
    ) -> Result<Vec<(MessageId, Vec<u8>)>, PriqError> {
        let mut conn = self.inner.pool.get().await?;
        let ids: Vec<String> = conn
            .zrange(self.inner.keys.dead_letter_queue(queue), 0, -1)
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut cmd = redis::cmd("HMGET");
        cmd.arg(self.inner.keys.dead_letter_messages(queue));
        cmd.arg(&ids);
        let payloads: Vec<Option<Vec<u8>>> = cmd.query_async(&mut conn).await?;
        Ok(ids
            .into_iter()
            .zip(payloads)
            .filter_map(|(id, payload)| payload.map(|payload| (id, payload)))
            .collect())
    }

    /// Known workers and their last heartbeat in epoch milliseconds.
    /// Read-only; bypasses the dispatch script.
    pub async fn heartbeats(&self) -> Result<Vec<(String, i64)>, PriqError> {
        let mut conn = self.inner.pool.get().await?;
        let entries: Vec<(String, f64)> = conn
            .zrange_withscores(&self.inner.keys.heartbeats, 0, -1)
            .await?;
        Ok(entries
            .into_iter()
            .map(|(worker_id, beat)| (worker_id, beat as i64))
            .collect())
    }

    async fn dispatch<T: FromRedisValue>(
        &self,
        command: &str,
        queue: &str,
        build: impl Fn(&mut ScriptInvocation<'_>),
    ) -> Result<T, PriqError> {
        let mut attempts = 0;
        loop {
            match self.try_dispatch(command, queue, &build).await {
                Ok(value) => return Ok(value),
                Err(err) if attempts + 1 < MAX_DISPATCH_ATTEMPTS && is_transient(&err) => {
                    attempts += 1;
                    let delay = compute_backoff(attempts, RETRY_MIN_BACKOFF, RETRY_MAX_BACKOFF);
                    tracing::warn!(
                        command,
                        queue,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Dispatch failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn try_dispatch<T: FromRedisValue>(
        &self,
        command: &str,
        queue: &str,
        build: &impl Fn(&mut ScriptInvocation<'_>),
    ) -> Result<T, PriqError> {
        let mut conn = self.inner.pool.get().await?;
        let mut invocation = self.inner.script.prepare_invoke();
        invocation
            .key(&self.inner.keys.namespace)
            .arg(command)
            .arg(chrono::Utc::now().timestamp_millis())
            .arg(queue)
            .arg(&self.inner.worker_id)
            .arg(self.inner.config.heartbeat_timeout_ms)
            .arg(self.inner.config.dead_message_ttl_ms)
            .arg(i32::from(self.maintenance_due()));
        build(&mut invocation);
        Ok(invocation.invoke_async(&mut conn).await?)
    }

    fn maintenance_due(&self) -> bool {
        rand::rng().random_bool(self.inner.config.maintenance_probability)
    }
}

fn is_transient(err: &PriqError) -> bool {
    match err {
        PriqError::Pool(_) => true,
        PriqError::Redis(err) => {
            err.is_io_error()
                || err.is_connection_refusal()
                || err.is_connection_dropped()
                || err.is_timeout()
        }
        _ => false,
    }
}
