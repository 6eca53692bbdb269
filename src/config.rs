use std::num::NonZero;
use std::time::Duration;

use crate::error::PriqError;

/// Environment variable consulted once at [`Config`] construction for the
/// priority given to messages enqueued without an explicit one.
pub const DEFAULT_PRIORITY_ENV: &str = "dramatiq_actor_default_priority";

/// Construction-time configuration shared by the broker client and the
/// worker. There is no hidden global state; everything a process needs is
/// carried in here.
#[derive(Clone, Debug)]
pub struct Config {
    pub(crate) namespace: String,
    pub(crate) heartbeat_timeout_ms: i64,
    pub(crate) dead_message_ttl_ms: i64,
    pub(crate) maintenance_probability: f64,
    pub(crate) default_priority: i64,
    pub(crate) executors: usize,
    pub(crate) prefetch: Option<usize>,
    pub(crate) max_tasks_per_child: u64,
    pub(crate) shutdown_grace: Duration,
    pub(crate) min_refresh: Duration,
    pub(crate) max_backoff: Duration,
    pub(crate) restart_nacks: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Self {
            namespace: "dramatiq".to_string(),
            heartbeat_timeout_ms: 60_000,
            dead_message_ttl_ms: 7 * 24 * 3600 * 1000,
            maintenance_probability: 0.01,
            default_priority: priority_from(std::env::var(DEFAULT_PRIORITY_ENV).ok().as_deref()),
            executors: std::thread::available_parallelism()
                .map(NonZero::get)
                .unwrap_or(1),
            prefetch: None,
            max_tasks_per_child: 0,
            shutdown_grace: Duration::from_millis(10_000),
            min_refresh: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1_000),
            restart_nacks: false,
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn heartbeat_timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.heartbeat_timeout_ms = timeout_ms;
        self
    }

    pub fn dead_message_ttl_ms(mut self, ttl_ms: i64) -> Self {
        self.dead_message_ttl_ms = ttl_ms;
        self
    }

    /// Fraction of dispatch calls that also run queue maintenance. Must lie
    /// in `(0, 1]`.
    pub fn maintenance_probability(mut self, probability: f64) -> Self {
        self.maintenance_probability = probability;
        self
    }

    pub fn default_priority(mut self, priority: i64) -> Self {
        self.default_priority = priority;
        self
    }

    /// Number of concurrent executors per worker process. Defaults to the
    /// available parallelism.
    pub fn executors(mut self, executors: usize) -> Self {
        self.executors = executors;
        self
    }

    /// Upper bound on buffered-but-unprocessed messages per consumer.
    /// Defaults to twice the executor count.
    pub fn prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    /// Number of messages a worker processes before requesting its own
    /// restart. `0` disables the limit.
    pub fn max_tasks_per_child(mut self, limit: u64) -> Self {
        self.max_tasks_per_child = limit;
        self
    }

    /// How long a draining worker waits for executors to finish their
    /// current message before giving up and exiting hard.
    pub fn shutdown_grace_ms(mut self, grace_ms: u64) -> Self {
        self.shutdown_grace = Duration::from_millis(grace_ms);
        self
    }

    /// Minimum delay between two consumer fetches on the same queue.
    pub fn min_refresh_ms(mut self, refresh_ms: u64) -> Self {
        self.min_refresh = Duration::from_millis(refresh_ms);
        self
    }

    /// Cap on the consumer's empty-queue polling backoff.
    pub fn max_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.max_backoff = Duration::from_millis(backoff_ms);
        self
    }

    /// Whether a task that requests a restart has its message nacked instead
    /// of acked.
    pub fn restart_nacks(mut self, nacks: bool) -> Self {
        self.restart_nacks = nacks;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), PriqError> {
        if self.namespace.is_empty() {
            return Err(PriqError::Config("namespace must not be empty".to_string()));
        }
        if self.heartbeat_timeout_ms <= 0 {
            return Err(PriqError::Config(
                "heartbeat_timeout_ms must be positive".to_string(),
            ));
        }
        if self.dead_message_ttl_ms <= 0 {
            return Err(PriqError::Config(
                "dead_message_ttl_ms must be positive".to_string(),
            ));
        }
        if !(self.maintenance_probability > 0.0 && self.maintenance_probability <= 1.0) {
            return Err(PriqError::Config(
                "maintenance_probability must lie in (0, 1]".to_string(),
            ));
        }
        if self.executors == 0 {
            return Err(PriqError::Config(
                "executors must be at least 1".to_string(),
            ));
        }
        if self.prefetch == Some(0) {
            return Err(PriqError::Config("prefetch must be at least 1".to_string()));
        }
        Ok(())
    }

    pub(crate) fn effective_prefetch(&self) -> usize {
        self.prefetch.unwrap_or(2 * self.executors.max(1))
    }
}

fn priority_from(value: Option<&str>) -> i64 {
    match value {
        None => 0,
        Some(raw) => match raw.trim().parse() {
            Ok(priority) => priority,
            Err(_) => {
                tracing::warn!(
                    value = raw,
                    "Ignoring unparseable {} value",
                    DEFAULT_PRIORITY_ENV
                );
                0
            }
        },
    }
}
