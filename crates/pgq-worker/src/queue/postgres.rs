//! PostgreSQL implementation of MessageQueue on top of pgmq
//!
//! All queue primitives are the `pgmq.*` SQL functions; this type only binds
//! parameters and maps rows and errors.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};

use super::store::*;
use crate::pg;

/// pgmq-backed message queue
///
/// # Example
///
/// ```ignore
/// use pgq_worker::queue::{MessageQueue, PgmqQueue};
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let queue = PgmqQueue::new(pool, "tasks");
/// queue.ensure_exists().await?;
/// ```
#[derive(Debug, Clone)]
pub struct PgmqQueue {
    pool: PgPool,
    queue_name: String,
}

impl PgmqQueue {
    /// Bind a queue name to a connection pool
    pub fn new(pool: PgPool, queue_name: impl Into<String>) -> Self {
        Self {
            pool,
            queue_name: queue_name.into(),
        }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn map_err(&self, operation: &'static str, e: sqlx::Error) -> QueueError {
        if pg::is_undefined_table(&e) {
            error!(queue = %self.queue_name, operation, "queue does not exist: {}", e);
            return QueueError::QueueNotFound(self.queue_name.clone());
        }
        if pg::is_transient(&e) {
            return QueueError::Transient(format!("{operation}: {e}"));
        }
        error!(queue = %self.queue_name, operation, "queue operation failed: {}", e);
        QueueError::Database(format!("{operation}: {e}"))
    }
}

#[async_trait]
impl MessageQueue for PgmqQueue {
    fn queue_name(&self) -> &str {
        &self.queue_name
    }

    #[instrument(skip(self), fields(queue = %self.queue_name))]
    async fn ensure_exists(&self) -> Result<(), QueueError> {
        // pgmq.create is a no-op for an existing queue
        sqlx::query("SELECT pgmq.create($1)")
            .bind(&self.queue_name)
            .execute(&self.pool)
            .await
            .map_err(|e| self.map_err("create", e))?;

        debug!("ensured queue exists");
        Ok(())
    }

    #[instrument(skip(self), fields(queue = %self.queue_name))]
    async fn drop_queue(&self) -> Result<bool, QueueError> {
        let dropped: bool = sqlx::query_scalar("SELECT pgmq.drop_queue($1)")
            .bind(&self.queue_name)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| self.map_err("drop_queue", e))?;

        debug!(dropped, "dropped queue");
        Ok(dropped)
    }

    #[instrument(skip(self, payload), fields(queue = %self.queue_name))]
    async fn send(&self, payload: serde_json::Value, delay: Duration) -> Result<i64, QueueError> {
        let msg_id: i64 = sqlx::query_scalar("SELECT pgmq.send($1::text, $2::jsonb, $3::integer)")
            .bind(&self.queue_name)
            .bind(&payload)
            .bind(seconds_i32(delay))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| self.map_err("send", e))?;

        debug!(msg_id, "sent message");
        Ok(msg_id)
    }

    #[instrument(skip(self), fields(queue = %self.queue_name, batch_size = params.batch_size))]
    async fn read_with_poll(&self, params: ReadParams) -> Result<Vec<QueuedMessage>, QueueError> {
        let rows = sqlx::query(
            r#"
            SELECT msg_id, read_ct, enqueued_at, vt, message
            FROM pgmq.read_with_poll($1::text, $2::integer, $3::integer, $4::integer, $5::integer)
            "#,
        )
        .bind(&self.queue_name)
        .bind(seconds_i32(params.visibility_timeout))
        .bind(i32::try_from(params.batch_size).unwrap_or(i32::MAX))
        .bind(seconds_i32(params.max_poll_duration))
        .bind(i32::try_from(params.poll_interval.as_millis()).unwrap_or(i32::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| self.map_err("read_with_poll", e))?;

        let messages = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| QueueError::Serialization(e.to_string()))?;

        if !messages.is_empty() {
            debug!(count = messages.len(), "leased messages");
        }
        Ok(messages)
    }

    #[instrument(skip(self), fields(queue = %self.queue_name))]
    async fn archive(&self, msg_id: i64) -> Result<bool, QueueError> {
        let archived: bool = sqlx::query_scalar("SELECT pgmq.archive($1::text, $2::bigint)")
            .bind(&self.queue_name)
            .bind(msg_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| self.map_err("archive", e))?;

        debug!(msg_id, archived, "archived message");
        Ok(archived)
    }

    #[instrument(skip(self), fields(queue = %self.queue_name))]
    async fn delay_retry(
        &self,
        msg_id: i64,
        delay_seconds: u64,
    ) -> Result<Option<QueuedMessage>, QueueError> {
        let row = sqlx::query(
            r#"
            SELECT msg_id, read_ct, enqueued_at, vt, message
            FROM pgmq.set_vt($1::text, $2::bigint, $3::integer)
            "#,
        )
        .bind(&self.queue_name)
        .bind(msg_id)
        .bind(i32::try_from(delay_seconds).unwrap_or(i32::MAX))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| self.map_err("set_vt", e))?;

        let message = row
            .as_ref()
            .map(message_from_row)
            .transpose()
            .map_err(|e| QueueError::Serialization(e.to_string()))?;

        debug!(msg_id, delay_seconds, found = message.is_some(), "delayed message");
        Ok(message)
    }
}

fn message_from_row(row: &PgRow) -> Result<QueuedMessage, sqlx::Error> {
    Ok(QueuedMessage {
        id: row.try_get("msg_id")?,
        payload: row.try_get("message")?,
        read_count: row.try_get("read_ct")?,
        enqueued_at: row.try_get("enqueued_at")?,
        lease_expires_at: row.try_get("vt")?,
    })
}

fn seconds_i32(duration: Duration) -> i32 {
    i32::try_from(duration.as_secs()).unwrap_or(i32::MAX)
}
