//! In-memory implementation of MessageQueue for testing

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::Instant;

use super::store::*;

/// Internal message state
struct StoredMessage {
    payload: serde_json::Value,
    read_count: i32,
    enqueued_at: DateTime<Utc>,
    visible_at: Instant,
}

/// Store operation targeted by [`InMemoryQueue::fail_next`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueOp {
    EnsureExists,
    Drop,
    Send,
    Read,
    Archive,
    DelayRetry,
}

/// One successful lease, kept for inspection by tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    pub msg_id: i64,
    pub read_count: i32,
    pub at: Instant,
}

#[derive(Default)]
struct QueueState {
    next_id: i64,
    active: BTreeMap<i64, StoredMessage>,
    archived: Vec<i64>,
}

/// In-memory implementation of MessageQueue
///
/// This is primarily for testing. It provides the same lease semantics as
/// pgmq, driven by the tokio clock so that tests can run with paused time.
///
/// # Example
///
/// ```
/// use pgq_worker::queue::InMemoryQueue;
///
/// let queue = InMemoryQueue::new("tasks");
/// ```
pub struct InMemoryQueue {
    name: String,
    state: Mutex<Option<QueueState>>,
    leases: Mutex<Vec<LeaseRecord>>,
    read_calls: Mutex<usize>,
    injected_failures: Mutex<HashMap<QueueOp, VecDeque<QueueError>>>,
}

impl InMemoryQueue {
    /// Create a new, not yet existing, queue
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(None),
            leases: Mutex::new(Vec::new()),
            read_calls: Mutex::new(0),
            injected_failures: Mutex::new(HashMap::new()),
        }
    }

    /// Create a queue that already exists
    pub fn created(name: impl Into<String>) -> Self {
        let queue = Self::new(name);
        *queue.state.lock() = Some(QueueState::default());
        queue
    }

    /// Number of messages not yet archived
    pub fn active_count(&self) -> usize {
        self.state.lock().as_ref().map_or(0, |s| s.active.len())
    }

    /// Ids of archived messages, in archive order
    pub fn archived_ids(&self) -> Vec<i64> {
        self.state
            .lock()
            .as_ref()
            .map(|s| s.archived.clone())
            .unwrap_or_default()
    }

    /// Current read count of an active message
    pub fn read_count(&self, msg_id: i64) -> Option<i32> {
        self.state
            .lock()
            .as_ref()
            .and_then(|s| s.active.get(&msg_id).map(|m| m.read_count))
    }

    /// Every lease handed out so far
    pub fn leases(&self) -> Vec<LeaseRecord> {
        self.leases.lock().clone()
    }

    /// Leases of one message, in order
    pub fn leases_of(&self, msg_id: i64) -> Vec<LeaseRecord> {
        self.leases
            .lock()
            .iter()
            .filter(|l| l.msg_id == msg_id)
            .cloned()
            .collect()
    }

    /// Number of `read_with_poll` calls made so far
    pub fn read_calls(&self) -> usize {
        *self.read_calls.lock()
    }

    /// Make the next call of `op` fail with `error`
    pub fn fail_next(&self, op: QueueOp, error: QueueError) {
        self.injected_failures
            .lock()
            .entry(op)
            .or_default()
            .push_back(error);
    }

    fn take_injected_failure(&self, op: QueueOp) -> Result<(), QueueError> {
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

    fn not_found(&self) -> QueueError {
        QueueError::QueueNotFound(self.name.clone())
    }

    fn try_lease(
        &self,
        batch_size: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueuedMessage>, QueueError> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or_else(|| self.not_found())?;

        let now = Instant::now();
        let lease_expires_at = Utc::now() + to_chrono(visibility_timeout);
        let mut leased = Vec::new();

        for (id, message) in state.active.iter_mut() {
            if leased.len() >= batch_size {
                break;
            }
            if message.visible_at > now {
                continue;
            }
            message.read_count += 1;
            message.visible_at = now + visibility_timeout;
            leased.push(QueuedMessage {
                id: *id,
                payload: message.payload.clone(),
                read_count: message.read_count,
                enqueued_at: message.enqueued_at,
                lease_expires_at,
            });
        }

        if !leased.is_empty() {
            let mut leases = self.leases.lock();
            leases.extend(leased.iter().map(|m| LeaseRecord {
                msg_id: m.id,
                read_count: m.read_count,
                at: now,
            }));
        }

        Ok(leased)
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    fn queue_name(&self) -> &str {
        &self.name
    }

    async fn ensure_exists(&self) -> Result<(), QueueError> {
        self.take_injected_failure(QueueOp::EnsureExists)?;
        self.state.lock().get_or_insert_with(QueueState::default);
        Ok(())
    }

    async fn drop_queue(&self) -> Result<bool, QueueError> {
        self.take_injected_failure(QueueOp::Drop)?;
        Ok(self.state.lock().take().is_some())
    }

    async fn send(&self, payload: serde_json::Value, delay: Duration) -> Result<i64, QueueError> {
        self.take_injected_failure(QueueOp::Send)?;
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or_else(|| self.not_found())?;

        state.next_id += 1;
        let id = state.next_id;
        state.active.insert(
            id,
            StoredMessage {
                payload,
                read_count: 0,
                enqueued_at: Utc::now(),
                visible_at: Instant::now() + delay,
            },
        );
        Ok(id)
    }

    async fn read_with_poll(&self, params: ReadParams) -> Result<Vec<QueuedMessage>, QueueError> {
        *self.read_calls.lock() += 1;
        self.take_injected_failure(QueueOp::Read)?;

        let deadline = Instant::now() + params.max_poll_duration;
        loop {
            let leased = self.try_lease(params.batch_size, params.visibility_timeout)?;
            if !leased.is_empty() {
                return Ok(leased);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(vec![]);
            }
            tokio::time::sleep(params.poll_interval.min(deadline - now)).await;
        }
    }

    async fn archive(&self, msg_id: i64) -> Result<bool, QueueError> {
        self.take_injected_failure(QueueOp::Archive)?;
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or_else(|| self.not_found())?;

        if state.active.remove(&msg_id).is_some() {
            state.archived.push(msg_id);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn delay_retry(
        &self,
        msg_id: i64,
        delay_seconds: u64,
    ) -> Result<Option<QueuedMessage>, QueueError> {
        self.take_injected_failure(QueueOp::DelayRetry)?;
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or_else(|| self.not_found())?;

        let delay = Duration::from_secs(delay_seconds);
        Ok(state.active.get_mut(&msg_id).map(|message| {
            message.visible_at = Instant::now() + delay;
            QueuedMessage {
                id: msg_id,
                payload: message.payload.clone(),
                read_count: message.read_count,
                enqueued_at: message.enqueued_at,
                lease_expires_at: Utc::now() + to_chrono(delay),
            }
        }))
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
