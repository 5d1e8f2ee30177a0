//! MessageQueue trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Error type for queue operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    /// The queue does not exist (never created, or dropped underneath us)
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    /// Connection-level failure that is expected to heal on its own
    #[error("transient store error: {0}")]
    Transient(String),

    /// Any other database error
    #[error("database error: {0}")]
    Database(String),

    /// Payload could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl QueueError {
    /// Whether retrying the same call later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// A message leased from the queue
///
/// The worker only ever holds a time-limited lease on it: once
/// `lease_expires_at` passes without an ack the message becomes visible to
/// other readers again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: i64,
    pub payload: serde_json::Value,
    /// Number of times the message has been leased, this lease included
    pub read_count: i32,
    pub enqueued_at: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
}

impl QueuedMessage {
    /// Handler attempt number of this lease (1-based)
    pub fn attempt(&self) -> u32 {
        u32::try_from(self.read_count).unwrap_or(0).max(1)
    }
}

/// Parameters of a single `read_with_poll` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadParams {
    /// Maximum number of messages to lease
    pub batch_size: usize,
    /// Upper bound of the call
    pub max_poll_duration: Duration,
    /// Spacing of re-checks while the queue is empty
    pub poll_interval: Duration,
    /// Lease duration of every returned message
    pub visibility_timeout: Duration,
}

/// Lease-based message store bound to a single queue
///
/// Implementations must be thread-safe. The lease (visibility timeout) is the
/// only redelivery mechanism: callers must assume that any message they do not
/// archive or delay will be handed out again once its lease expires.
#[async_trait]
pub trait MessageQueue: Send + Sync + 'static {
    /// Name of the queue this store is bound to
    fn queue_name(&self) -> &str;

    /// Create the queue if it does not exist yet
    async fn ensure_exists(&self) -> Result<(), QueueError>;

    /// Drop the queue and all of its messages
    ///
    /// Returns `false` if the queue did not exist.
    async fn drop_queue(&self) -> Result<bool, QueueError>;

    /// Enqueue a message, invisible for `delay`
    async fn send(&self, payload: serde_json::Value, delay: Duration) -> Result<i64, QueueError>;

    /// Lease up to `batch_size` messages
    ///
    /// Waits up to `max_poll_duration`, re-checking every `poll_interval`, and
    /// returns as soon as at least one message is available. An empty result
    /// means the budget elapsed.
    async fn read_with_poll(&self, params: ReadParams) -> Result<Vec<QueuedMessage>, QueueError>;

    /// Remove a message from the active queue
    ///
    /// Idempotent: archiving an unknown id returns `Ok(false)`.
    async fn archive(&self, msg_id: i64) -> Result<bool, QueueError>;

    /// Hide a message for `delay_seconds` from now
    ///
    /// Returns the updated message, or `None` if it no longer exists.
    async fn delay_retry(
        &self,
        msg_id: i64,
        delay_seconds: u64,
    ) -> Result<Option<QueuedMessage>, QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(read_count: i32) -> QueuedMessage {
        QueuedMessage {
            id: 1,
            payload: serde_json::json!({}),
            read_count,
            enqueued_at: Utc::now(),
            lease_expires_at: Utc::now(),
        }
    }

    #[test]
    fn test_attempt_follows_read_count() {
        assert_eq!(message(1).attempt(), 1);
        assert_eq!(message(4).attempt(), 4);
    }

    #[test]
    fn test_attempt_never_zero() {
        assert_eq!(message(0).attempt(), 1);
        assert_eq!(message(-3).attempt(), 1);
    }

    #[test]
    fn test_only_transient_is_transient() {
        assert!(QueueError::Transient("reset".into()).is_transient());
        assert!(!QueueError::QueueNotFound("tasks".into()).is_transient());
        assert!(!QueueError::Database("syntax".into()).is_transient());
    }
}
