//! PostgreSQL implementation of WorkerRegistry
//!
//! Expects the `workers` table from `migrations/`.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use super::store::*;
use crate::pg;

/// PostgreSQL implementation of WorkerRegistry
///
/// # Example
///
/// ```ignore
/// use pgq_worker::registry::{PostgresWorkerRegistry, WorkerRegistry};
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let registry = PostgresWorkerRegistry::new(pool);
/// registry.migrate().await?;
/// ```
#[derive(Debug, Clone)]
pub struct PostgresWorkerRegistry {
    pool: PgPool,
}

impl PostgresWorkerRegistry {
    /// Create a new registry with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled `workers` table migration
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

fn map_err(operation: &'static str, e: sqlx::Error) -> RegistryError {
    if pg::is_transient(&e) {
        return RegistryError::Transient(format!("{operation}: {e}"));
    }
    error!(operation, "registry operation failed: {}", e);
    RegistryError::Database(format!("{operation}: {e}"))
}

fn record_from_row(row: &PgRow) -> Result<WorkerRecord, sqlx::Error> {
    Ok(WorkerRecord {
        worker_id: row.try_get("worker_id")?,
        queue_name: row.try_get("queue_name")?,
        started_at: row.try_get("started_at")?,
        last_heartbeat_at: row.try_get("last_heartbeat_at")?,
        deprecated_at: row.try_get("deprecated_at")?,
        stopped_at: row.try_get("stopped_at")?,
    })
}

const RECORD_COLUMNS: &str =
    "worker_id, queue_name, started_at, last_heartbeat_at, deprecated_at, stopped_at";

#[async_trait]
impl WorkerRegistry for PostgresWorkerRegistry {
    #[instrument(skip(self))]
    async fn register(
        &self,
        worker_id: Uuid,
        queue_name: &str,
    ) -> Result<WorkerRecord, RegistryError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO workers (worker_id, queue_name, started_at, last_heartbeat_at)
            VALUES ($1, $2, now(), now())
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(worker_id)
        .bind(queue_name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if pg::is_unique_violation(&e) {
                RegistryError::AlreadyRegistered(worker_id)
            } else {
                map_err("register", e)
            }
        })?;

        let record = record_from_row(&row).map_err(|e| map_err("register", e))?;
        info!(%worker_id, queue = queue_name, "registered worker");
        Ok(record)
    }

    #[instrument(skip(self))]
    async fn heartbeat(&self, worker_id: Uuid) -> Result<HeartbeatResponse, RegistryError> {
        let row = sqlx::query(
            r#"
            UPDATE workers
            SET last_heartbeat_at = now()
            WHERE worker_id = $1
            RETURNING deprecated_at
            "#,
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_err("heartbeat", e))?
        .ok_or(RegistryError::WorkerNotFound(worker_id))?;

        let deprecated_at = row
            .try_get("deprecated_at")
            .map_err(|e| map_err("heartbeat", e))?;
        debug!(%worker_id, "heartbeat");
        Ok(HeartbeatResponse { deprecated_at })
    }

    #[instrument(skip(self))]
    async fn mark_stopped(&self, worker_id: Uuid) -> Result<bool, RegistryError> {
        // greatest() keeps stopped_at >= started_at under clock skew
        let result = sqlx::query(
            r#"
            UPDATE workers
            SET stopped_at = greatest(now(), started_at)
            WHERE worker_id = $1 AND stopped_at IS NULL
            "#,
        )
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(|e| map_err("mark_stopped", e))?;

        let written = result.rows_affected() > 0;
        debug!(%worker_id, written, "marked worker stopped");
        Ok(written)
    }

    #[instrument(skip(self))]
    async fn get(&self, worker_id: Uuid) -> Result<Option<WorkerRecord>, RegistryError> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM workers WHERE worker_id = $1"
        ))
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_err("get", e))?;

        row.as_ref()
            .map(record_from_row)
            .transpose()
            .map_err(|e| map_err("get", e))
    }

    #[instrument(skip(self))]
    async fn list_workers(&self, queue_name: &str) -> Result<Vec<WorkerRecord>, RegistryError> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM workers WHERE queue_name = $1 ORDER BY started_at"
        ))
        .bind(queue_name)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_err("list_workers", e))?;

        rows.iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| map_err("list_workers", e))
    }

    #[instrument(skip(self))]
    async fn deprecate(&self, worker_id: Uuid) -> Result<bool, RegistryError> {
        let result = sqlx::query(
            r#"
            UPDATE workers
            SET deprecated_at = now()
            WHERE worker_id = $1 AND deprecated_at IS NULL
            "#,
        )
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(|e| map_err("deprecate", e))?;

        let deprecated = result.rows_affected() > 0;
        info!(%worker_id, deprecated, "deprecated worker");
        Ok(deprecated)
    }

    #[instrument(skip(self))]
    async fn deprecate_queue_workers(&self, queue_name: &str) -> Result<u64, RegistryError> {
        let result = sqlx::query(
            r#"
            UPDATE workers
            SET deprecated_at = now()
            WHERE queue_name = $1 AND deprecated_at IS NULL AND stopped_at IS NULL
            "#,
        )
        .bind(queue_name)
        .execute(&self.pool)
        .await
        .map_err(|e| map_err("deprecate_queue_workers", e))?;

        let count = result.rows_affected();
        info!(queue = queue_name, count, "deprecated queue workers");
        Ok(count)
    }
}
