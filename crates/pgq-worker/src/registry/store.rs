//! WorkerRegistry trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error type for registry operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    /// No record for this worker
    #[error("worker not found: {0}")]
    WorkerNotFound(Uuid),

    /// A record with this id already exists
    #[error("worker already registered: {0}")]
    AlreadyRegistered(Uuid),

    /// Connection-level failure that is expected to heal on its own
    #[error("transient store error: {0}")]
    Transient(String),

    /// Any other database error
    #[error("database error: {0}")]
    Database(String),
}

impl RegistryError {
    /// Whether retrying the same call later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Persisted worker row
///
/// Written by the worker itself (`last_heartbeat_at`, `stopped_at`) and by an
/// external operator (`deprecated_at`). `stopped_at` is set at most once and
/// never precedes `started_at`; `deprecated_at` is never cleared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: Uuid,
    pub queue_name: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub deprecated_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl WorkerRecord {
    /// Whether an operator asked this worker to step down
    pub fn is_deprecated(&self) -> bool {
        self.deprecated_at.is_some()
    }

    /// Whether the worker has shut down
    pub fn is_stopped(&self) -> bool {
        self.stopped_at.is_some()
    }
}

/// Response from a worker heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatResponse {
    /// Deprecation timestamp of the worker's own record, read in the same
    /// statement as the heartbeat write
    pub deprecated_at: Option<DateTime<Utc>>,
}

impl HeartbeatResponse {
    /// Whether the worker should stop accepting new work
    pub fn should_deprecate(&self) -> bool {
        self.deprecated_at.is_some()
    }
}

/// Store for the `workers` table
///
/// Nothing but the owning worker and operators touching `deprecated_at` write
/// to a row.
#[async_trait]
pub trait WorkerRegistry: Send + Sync + 'static {
    /// Insert a fresh record with `started_at = last_heartbeat_at = now`
    async fn register(&self, worker_id: Uuid, queue_name: &str)
        -> Result<WorkerRecord, RegistryError>;

    /// Bump `last_heartbeat_at` and read back `deprecated_at`
    async fn heartbeat(&self, worker_id: Uuid) -> Result<HeartbeatResponse, RegistryError>;

    /// Set `stopped_at` if it is not set yet
    ///
    /// Returns `true` if this call wrote it.
    async fn mark_stopped(&self, worker_id: Uuid) -> Result<bool, RegistryError>;

    /// Fetch a single record
    async fn get(&self, worker_id: Uuid) -> Result<Option<WorkerRecord>, RegistryError>;

    /// List records of a queue, oldest first
    async fn list_workers(&self, queue_name: &str) -> Result<Vec<WorkerRecord>, RegistryError>;

    // =========================================================================
    // Operator Operations
    // =========================================================================

    /// Request a single worker to step down
    ///
    /// Returns `true` if the record was not deprecated before.
    async fn deprecate(&self, worker_id: Uuid) -> Result<bool, RegistryError>;

    /// Request every running worker of a queue to step down (rolling deploy)
    ///
    /// Returns the number of newly deprecated workers.
    async fn deprecate_queue_workers(&self, queue_name: &str) -> Result<u64, RegistryError>;
}
