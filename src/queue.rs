//! Queue transport seams: publish on the trigger side, drain on the
//! consumer side. Delivery is at-least-once; a message not acked before its
//! visibility window expires is handed out again.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Topic carrying batches of product push requests (JSON array payload).
pub const PRODUCT_PUSH_TOPIC: &str = "product-push";
/// Topic carrying stock update messages (one JSON object per message).
pub const STOCK_PUSH_TOPIC: &str = "stock-push";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        QueueError::Backend(err.to_string())
    }
}

/// A message handed out by a queue source.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub id: String,
    pub topic: String,
    pub payload: String,
    /// How many times this message has been handed out, including this one.
    pub attempt: i64,
    pub enqueued_at: DateTime<Utc>,
}

#[async_trait]
pub trait QueuePublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), QueueError>;
}

#[async_trait]
pub trait QueueSource: Send + Sync {
    /// Fetch the next due message on the topic, if any. The message becomes
    /// invisible to other consumers for the backend's visibility window.
    async fn next(&self, topic: &str) -> Result<Option<QueuedMessage>, QueueError>;

    /// Acknowledge successful processing; the message is removed for good.
    async fn ack(&self, id: &str) -> Result<(), QueueError>;

    /// Return the message to the queue with capped exponential backoff.
    async fn nack(&self, id: &str, max_backoff_secs: i64) -> Result<(), QueueError>;
}
