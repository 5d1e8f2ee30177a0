//! Bounded admission of executions
//!
//! A semaphore of `max_concurrent` permits is the only shared counter: a
//! permit is held for the whole life of a spawned execution and released by
//! drop, whether the execution finished normally or unwound.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::executor::{ExecutionOutcome, ExecutionTask, MessageExecutor};

/// Controller errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ControllerError {
    /// The controller was drained and takes no more work
    #[error("execution controller is closed")]
    Closed,
}

/// Decrements the in-flight counter even if the execution unwinds
struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Runs at most `max_concurrent` executions at once
pub struct ExecutionController {
    executor: Arc<MessageExecutor>,
    slots: Arc<Semaphore>,
    max_concurrent: usize,
    in_flight: Arc<AtomicUsize>,
    tracker: TaskTracker,
}

impl ExecutionController {
    pub fn new(executor: Arc<MessageExecutor>, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            executor,
            slots: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            in_flight: Arc::new(AtomicUsize::new(0)),
            tracker: TaskTracker::new(),
        }
    }

    /// Start executing a task once a slot is free
    ///
    /// Waits for a slot, spawns the execution and returns without waiting for
    /// it. Failures of the execution never reach the caller.
    pub async fn submit(&self, task: ExecutionTask) -> Result<(), ControllerError> {
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| ControllerError::Closed)?;

        let executor = Arc::clone(&self.executor);
        let guard = InFlightGuard::enter(&self.in_flight);
        let msg_id = task.message.id;

        let handle = self.tracker.spawn(async move {
            let _guard = guard;
            let _permit = permit;
            executor.run(task).await
        });

        // Watch for unwinding outside the handler, which the executor does not catch
        self.tracker.spawn(async move {
            match handle.await {
                Ok(ExecutionOutcome::Unresolved) => {
                    debug!(msg_id, "execution left to lease expiry");
                }
                Ok(_) => {}
                Err(e) if e.is_panic() => {
                    error!(msg_id, "execution panicked, treating as failed");
                }
                Err(e) => {
                    warn!(msg_id, "execution aborted: {}", e);
                }
            }
        });

        Ok(())
    }

    /// Number of free slots
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Number of executions currently running
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Wait until at least one slot is free
    ///
    /// Returns immediately if the controller has been drained.
    pub async fn wait_for_slot(&self) {
        // The permit goes straight back; this only waits for one to exist
        let _ = self.slots.acquire().await;
    }

    /// Stop admitting work and wait for running executions to finish
    ///
    /// Returns `false` if `timeout` elapsed first; those executions keep
    /// running detached and their messages fall back to lease expiry if the
    /// process exits.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.slots.close();
        self.tracker.close();

        let in_flight = self.in_flight();
        if in_flight > 0 {
            info!(in_flight, "waiting for in-flight executions");
        }

        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    remaining = self.in_flight(),
                    "timed out waiting for in-flight executions"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::execution::executor::handler_fn;
    use crate::queue::{InMemoryQueue, MessageQueue, ReadParams};
    use crate::reliability::RetryConfig;

    async fn lease_all(queue: &InMemoryQueue, n: usize) -> Vec<ExecutionTask> {
        let params = ReadParams {
            batch_size: n,
            max_poll_duration: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
            visibility_timeout: Duration::from_secs(300),
        };
        queue
            .read_with_poll(params)
            .await
            .unwrap()
            .into_iter()
            .map(|m| ExecutionTask::new(m, CancellationToken::new()))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_never_exceeds_limit() {
        let max_concurrent = 4;
        let queue = Arc::new(InMemoryQueue::created("tasks"));
        for n in 0..max_concurrent * 10 {
            queue.send(json!({ "n": n }), Duration::ZERO).await.unwrap();
        }

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (running_h, peak_h) = (Arc::clone(&running), Arc::clone(&peak));
        let handler = handler_fn(move |payload, _| {
            let running = Arc::clone(&running_h);
            let peak = Arc::clone(&peak_h);
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                let n = payload["n"].as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(10 + n % 7)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let executor = Arc::new(MessageExecutor::new(
            queue.clone(),
            handler,
            RetryConfig::default(),
        ));
        let controller = ExecutionController::new(executor, max_concurrent);

        for task in lease_all(&queue, max_concurrent * 10).await {
            controller.submit(task).await.unwrap();
            assert!(controller.in_flight() <= max_concurrent);
        }
        assert!(controller.drain(Duration::from_secs(60)).await);

        assert!(peak.load(Ordering::SeqCst) <= max_concurrent);
        assert_eq!(peak.load(Ordering::SeqCst), max_concurrent);
        assert_eq!(queue.archived_ids().len(), max_concurrent * 10);
        assert_eq!(controller.in_flight(), 0);
        assert_eq!(controller.available_slots(), max_concurrent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slot_released_after_handler_panic() {
        let queue = Arc::new(InMemoryQueue::created("tasks"));
        queue.send(json!({}), Duration::ZERO).await.unwrap();
        let handler = handler_fn(|_, ctx| async move {
            if ctx.attempt > 0 {
                panic!("boom");
            }
            Ok(())
        });
        let executor = Arc::new(MessageExecutor::new(queue.clone(), handler, RetryConfig::default()));
        let controller = ExecutionController::new(executor, 1);

        for task in lease_all(&queue, 1).await {
            controller.submit(task).await.unwrap();
        }
        assert!(controller.drain(Duration::from_secs(5)).await);

        assert_eq!(controller.available_slots(), 1);
        assert_eq!(controller.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_slot_resumes_when_execution_finishes() {
        let queue = Arc::new(InMemoryQueue::created("tasks"));
        queue.send(json!({}), Duration::ZERO).await.unwrap();
        let handler = handler_fn(|_, _| async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(())
        });
        let executor = Arc::new(MessageExecutor::new(queue.clone(), handler, RetryConfig::default()));
        let controller = ExecutionController::new(executor, 1);

        for task in lease_all(&queue, 1).await {
            controller.submit(task).await.unwrap();
        }
        assert_eq!(controller.available_slots(), 0);

        let started = tokio::time::Instant::now();
        controller.wait_for_slot().await;
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(controller.available_slots(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_times_out_on_stuck_handler() {
        let queue = Arc::new(InMemoryQueue::created("tasks"));
        queue.send(json!({}), Duration::ZERO).await.unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_h = Arc::clone(&calls);
        let handler = handler_fn(move |_, _| {
            calls_h.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
        });
        let executor = Arc::new(MessageExecutor::new(queue.clone(), handler, RetryConfig::default()));
        let controller = ExecutionController::new(executor, 2);

        for task in lease_all(&queue, 1).await {
            controller.submit(task).await.unwrap();
        }

        assert!(!controller.drain(Duration::from_secs(1)).await);
        assert_eq!(controller.in_flight(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_submit_after_drain_is_rejected() {
        let queue = Arc::new(InMemoryQueue::created("tasks"));
        queue.send(json!({}), Duration::ZERO).await.unwrap();
        let executor = Arc::new(MessageExecutor::new(
            queue.clone(),
            handler_fn(|_, _| async { Ok(()) }),
            RetryConfig::default(),
        ));
        let controller = ExecutionController::new(executor, 2);
        assert!(controller.drain(Duration::from_secs(1)).await);

        let task = lease_all(&queue, 1).await.remove(0);
        assert!(matches!(
            controller.submit(task).await,
            Err(ControllerError::Closed)
        ));
    }
}
