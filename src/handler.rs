use async_trait::async_trait;

use crate::message::Delivery;

pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

/// How a task invocation ended. Failure classification is explicit rather
/// than inferred from error types: the handler decides whether an error is
/// worth retrying, terminal, or a cooperative request to recycle the process.
#[derive(Debug)]
pub enum Outcome {
    /// The message is acked and deleted.
    Success,
    /// The message is left un-acked for an external retry policy. If the
    /// worker dies first, crash recovery returns it to the queue.
    Retryable(TaskError),
    /// The message is nacked into the dead-letter queue.
    Terminal(TaskError),
    /// The message completes normally (acked by default) and the worker
    /// drains and exits with the restart code once the `RestartOnRequest`
    /// middleware observes this outcome.
    RestartRequested,
}

impl Outcome {
    pub fn retryable(err: impl Into<TaskError>) -> Self {
        Self::Retryable(err.into())
    }

    pub fn terminal(err: impl Into<TaskError>) -> Self {
        Self::Terminal(err.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// User task entry point. One handler serves every queue a worker subscribes
/// to; payload decoding is the handler's concern.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn process(&self, delivery: &Delivery) -> Outcome;
}
