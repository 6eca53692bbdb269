use uuid::Uuid;

pub type MessageId = String;

/// A message as submitted by a producer. Immutable once enqueued; re-enqueuing
/// the same id replaces the stored payload and priority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub queue: String,
    pub priority: i64,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(queue: impl Into<String>, payload: impl Into<Vec<u8>>, priority: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            queue: queue.into(),
            priority,
            payload: payload.into(),
        }
    }

    /// Builds a message with a producer-chosen id. Ids must be unique across
    /// the namespace for the lifetime of the message.
    pub fn with_id(
        id: impl Into<MessageId>,
        queue: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        priority: i64,
    ) -> Self {
        Self {
            id: id.into(),
            queue: queue.into(),
            priority,
            payload: payload.into(),
        }
    }
}

/// A fetched message handed to an executor. The broker holds a matching entry
/// in this worker's ack group until the delivery is acked or nacked; dropping
/// it without either leaves crash recovery to pick it up.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: MessageId,
    pub queue: String,
    /// Priority the message had at fetch time, preserved so a requeue
    /// restores the original ordering.
    pub priority: i64,
    pub payload: Vec<u8>,
}
