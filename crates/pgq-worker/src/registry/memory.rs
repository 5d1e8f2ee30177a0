//! In-memory implementation of WorkerRegistry for testing

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use super::store::*;

/// Registry operation targeted by [`InMemoryWorkerRegistry::fail_next`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistryOp {
    Register,
    Heartbeat,
    MarkStopped,
}

/// In-memory implementation of WorkerRegistry
///
/// This is primarily for testing. Besides the records it counts heartbeats and
/// `stopped_at` writes, and can be told to fail upcoming calls.
#[derive(Default)]
pub struct InMemoryWorkerRegistry {
    workers: DashMap<Uuid, WorkerRecord>,
    heartbeats: AtomicUsize,
    stopped_writes: AtomicUsize,
    injected_failures: Mutex<HashMap<RegistryOp, VecDeque<RegistryError>>>,
}

impl InMemoryWorkerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful heartbeats across all workers
    pub fn heartbeat_count(&self) -> usize {
        self.heartbeats.load(Ordering::SeqCst)
    }

    /// Number of times `stopped_at` was actually written
    pub fn stopped_writes(&self) -> usize {
        self.stopped_writes.load(Ordering::SeqCst)
    }

    /// Make the next call of `op` fail with `error`
    pub fn fail_next(&self, op: RegistryOp, error: RegistryError) {
        self.injected_failures
            .lock()
            .entry(op)
            .or_default()
            .push_back(error);
    }

    fn take_injected_failure(&self, op: RegistryOp) -> Result<(), RegistryError> {
        match self
            .injected_failures
            .lock()
            .get_mut(&op)
            .and_then(VecDeque::pop_front)
        {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl WorkerRegistry for InMemoryWorkerRegistry {
    async fn register(
        &self,
        worker_id: Uuid,
        queue_name: &str,
    ) -> Result<WorkerRecord, RegistryError> {
        self.take_injected_failure(RegistryOp::Register)?;

        let now = Utc::now();
        let record = WorkerRecord {
            worker_id,
            queue_name: queue_name.to_string(),
            started_at: now,
            last_heartbeat_at: now,
            deprecated_at: None,
            stopped_at: None,
        };

        match self.workers.entry(worker_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(RegistryError::AlreadyRegistered(worker_id))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(record.clone());
                Ok(record)
            }
        }
    }

    async fn heartbeat(&self, worker_id: Uuid) -> Result<HeartbeatResponse, RegistryError> {
        self.take_injected_failure(RegistryOp::Heartbeat)?;

        let mut record = self
            .workers
            .get_mut(&worker_id)
            .ok_or(RegistryError::WorkerNotFound(worker_id))?;
        record.last_heartbeat_at = Utc::now();
        self.heartbeats.fetch_add(1, Ordering::SeqCst);

        Ok(HeartbeatResponse {
            deprecated_at: record.deprecated_at,
        })
    }

    async fn mark_stopped(&self, worker_id: Uuid) -> Result<bool, RegistryError> {
        self.take_injected_failure(RegistryOp::MarkStopped)?;

        let Some(mut record) = self.workers.get_mut(&worker_id) else {
            return Ok(false);
        };
        if record.stopped_at.is_some() {
            return Ok(false);
        }
        record.stopped_at = Some(Utc::now().max(record.started_at));
        self.stopped_writes.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn get(&self, worker_id: Uuid) -> Result<Option<WorkerRecord>, RegistryError> {
        Ok(self.workers.get(&worker_id).map(|r| r.clone()))
    }

    async fn list_workers(&self, queue_name: &str) -> Result<Vec<WorkerRecord>, RegistryError> {
        let mut records: Vec<WorkerRecord> = self
            .workers
            .iter()
            .filter(|r| r.queue_name == queue_name)
            .map(|r| r.clone())
            .collect();
        records.sort_by_key(|r| r.started_at);
        Ok(records)
    }

    async fn deprecate(&self, worker_id: Uuid) -> Result<bool, RegistryError> {
        let mut record = self
            .workers
            .get_mut(&worker_id)
            .ok_or(RegistryError::WorkerNotFound(worker_id))?;
        if record.deprecated_at.is_some() {
            return Ok(false);
        }
        record.deprecated_at = Some(Utc::now());
        Ok(true)
    }

    async fn deprecate_queue_workers(&self, queue_name: &str) -> Result<u64, RegistryError> {
        let now = Utc::now();
        let mut count = 0;
        for mut record in self.workers.iter_mut() {
            if record.queue_name == queue_name
                && record.deprecated_at.is_none()
                && record.stopped_at.is_none()
            {
                record.deprecated_at = Some(now);
                count += 1;
            }
        }
        Ok(count)
    }
}
