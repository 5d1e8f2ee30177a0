//! End-to-end worker scenarios over the in-memory stores
//!
//! Run with: cargo test -p pgq-worker --test worker_scenarios_test
//!
//! All tests run on a paused tokio clock, so delays of several seconds
//! complete instantly and lease timestamps are exact.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use pgq_worker::execution::{handler_fn, BatchExit, MessageHandler};
use pgq_worker::queue::{InMemoryQueue, MessageQueue};
use pgq_worker::registry::{InMemoryWorkerRegistry, WorkerRegistry};
use pgq_worker::{LifecycleState, QueueError, RetryConfig, Worker, WorkerConfig, WorkerError};

struct Fixture {
    queue: Arc<InMemoryQueue>,
    registry: Arc<InMemoryWorkerRegistry>,
    worker: Worker,
    worker_id: Uuid,
}

async fn start_worker(config: WorkerConfig, handler: MessageHandler) -> Fixture {
    let queue = Arc::new(InMemoryQueue::new(config.queue_name.clone()));
    let registry = Arc::new(InMemoryWorkerRegistry::new());
    let worker = Worker::new(queue.clone(), registry.clone(), config, handler)
        .expect("valid configuration");
    let worker_id = Uuid::now_v7();
    worker.start(worker_id).await.expect("worker starts");

    Fixture {
        queue,
        registry,
        worker,
        worker_id,
    }
}

fn always_failing(calls: Arc<AtomicU32>) -> MessageHandler {
    handler_fn(move |_, _| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move { Err(anyhow::anyhow!("handler always fails")) }
    })
}

/// Gaps between successive leases of one message
fn lease_gaps(queue: &InMemoryQueue, msg_id: i64) -> Vec<Duration> {
    queue
        .leases_of(msg_id)
        .windows(2)
        .map(|pair| pair[1].at - pair[0].at)
        .collect()
}

fn assert_close(actual: Duration, expected: Duration) {
    assert!(
        actual >= expected && actual < expected + Duration::from_millis(500),
        "expected a gap of about {expected:?}, got {actual:?}"
    );
}

// ============================================
// Retry Scenarios
// ============================================

#[test_log::test(tokio::test(start_paused = true))]
async fn test_always_failing_handler_runs_limit_times_then_archived() {
    let calls = Arc::new(AtomicU32::new(0));
    let config = WorkerConfig::new("tasks").with_retry(RetryConfig::fixed(3, 1));
    let f = start_worker(config, always_failing(calls.clone())).await;

    let id = f.queue.send(json!({"job": "flaky"}), Duration::ZERO).await.unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(f.queue.archived_ids(), vec![id]);
    assert_eq!(f.queue.leases_of(id).len(), 3);

    f.worker.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_fixed_retry_gaps() {
    let config = WorkerConfig::new("tasks").with_retry(RetryConfig::fixed(3, 3));
    let f = start_worker(config, always_failing(Arc::new(AtomicU32::new(0)))).await;

    let id = f.queue.send(json!({}), Duration::ZERO).await.unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;

    let gaps = lease_gaps(&f.queue, id);
    assert_eq!(gaps.len(), 2);
    for gap in gaps {
        assert_close(gap, Duration::from_secs(3));
    }

    f.worker.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_exponential_retry_gaps() {
    let config = WorkerConfig::new("tasks").with_retry(RetryConfig::exponential(3, 2));
    let f = start_worker(config, always_failing(Arc::new(AtomicU32::new(0)))).await;

    let id = f.queue.send(json!({}), Duration::ZERO).await.unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;

    let gaps = lease_gaps(&f.queue, id);
    assert_eq!(gaps.len(), 2);
    assert_close(gaps[0], Duration::from_secs(2));
    assert_close(gaps[1], Duration::from_secs(4));
    assert_eq!(f.queue.archived_ids(), vec![id]);

    f.worker.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_recovering_handler_completes_on_retry() {
    let calls = Arc::new(AtomicU32::new(0));
    let calls_h = Arc::clone(&calls);
    let handler = handler_fn(move |_, ctx| {
        calls_h.fetch_add(1, Ordering::SeqCst);
        async move {
            if ctx.attempt < 2 {
                anyhow::bail!("first attempt fails");
            }
            Ok(())
        }
    });
    let config = WorkerConfig::new("tasks").with_retry(RetryConfig::fixed(5, 1));
    let f = start_worker(config, handler).await;

    let id = f.queue.send(json!({}), Duration::ZERO).await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(f.queue.archived_ids(), vec![id]);

    f.worker.stop().await.unwrap();
}

// ============================================
// Concurrency
// ============================================

#[tokio::test(start_paused = true)]
async fn test_concurrency_bound_under_stress() {
    let max_concurrent = 5;
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
            tokio::time::sleep(Duration::from_millis(100 + 13 * (n % 5))).await;
            running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    });
    let config = WorkerConfig::new("tasks")
        .with_max_concurrent(max_concurrent)
        .with_visibility_timeout_seconds(30);
    let f = start_worker(config, handler).await;

    for n in 0..max_concurrent * 10 {
        f.queue.send(json!({ "n": n }), Duration::ZERO).await.unwrap();
    }
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(f.queue.archived_ids().len(), max_concurrent * 10);
    assert!(peak.load(Ordering::SeqCst) <= max_concurrent);
    assert!(f.worker.status().in_flight <= max_concurrent);

    f.worker.stop().await.unwrap();
}

// ============================================
// Deprecation and Shutdown
// ============================================

#[test_log::test(tokio::test(start_paused = true))]
async fn test_deprecation_stops_polling_and_lets_in_flight_work_finish() {
    let handler = handler_fn(|_, _| async move {
        tokio::time::sleep(Duration::from_secs(8)).await;
        Ok(())
    });
    let config = WorkerConfig::new("tasks").with_visibility_timeout_seconds(30);
    let f = start_worker(config, handler).await;

    let slow = f.queue.send(json!({"job": "slow"}), Duration::ZERO).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(f.worker.status().in_flight, 1);

    f.registry.deprecate(f.worker_id).await.unwrap();
    assert!(f.worker.status().accepting_work);

    // Next heartbeat at 5s flips the state; a poll already running may finish
    tokio::time::sleep(Duration::from_secs(10)).await;
    let status = f.worker.status();
    assert_eq!(status.state, LifecycleState::Deprecated);
    assert!(!status.accepting_work);
    assert!(!status.polling);

    let reads_after_deprecation = f.queue.read_calls();
    let late = f.queue.send(json!({"job": "late"}), Duration::ZERO).await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(f.queue.read_calls(), reads_after_deprecation);
    assert!(f.queue.leases_of(late).is_empty());
    assert_eq!(f.queue.archived_ids(), vec![slow]);

    // Heartbeats continue while deprecated
    assert!(f.registry.heartbeat_count() >= 4);
    assert_eq!(
        f.worker.closed().await.unwrap(),
        BatchExit::NotAccepting(LifecycleState::Deprecated)
    );

    f.worker.stop().await.unwrap();
    assert_eq!(f.worker.status().state, LifecycleState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_stop_twice_writes_stopped_at_once() {
    let f = start_worker(
        WorkerConfig::new("tasks"),
        handler_fn(|_, _| async { Ok(()) }),
    )
    .await;

    tokio_test::assert_ok!(f.worker.stop().await);
    tokio_test::assert_ok!(f.worker.stop().await);

    assert_eq!(f.registry.stopped_writes(), 1);
    let record = f.registry.get(f.worker_id).await.unwrap().unwrap();
    assert!(record.stopped_at.unwrap() >= record.started_at);
    assert_eq!(f.worker.status().state, LifecycleState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_stop_waits_for_in_flight_handler() {
    let finished = Arc::new(AtomicU32::new(0));
    let finished_h = Arc::clone(&finished);
    let handler = handler_fn(move |_, ctx| {
        let finished = Arc::clone(&finished_h);
        async move {
            // Cooperative: the handler sees shutdown but completes its work
            tokio::time::sleep(Duration::from_secs(2)).await;
            assert!(ctx.is_cancelled());
            finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });
    let config = WorkerConfig::new("tasks").with_visibility_timeout_seconds(30);
    let f = start_worker(config, handler).await;

    let id = f.queue.send(json!({}), Duration::ZERO).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    f.worker.stop().await.unwrap();

    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(f.queue.archived_ids(), vec![id]);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_timeout_reported() {
    let handler = handler_fn(|_, _| async move {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    });
    let config = WorkerConfig::new("tasks")
        .with_shutdown_timeout(Duration::from_secs(1))
        .with_visibility_timeout_seconds(30);
    let f = start_worker(config, handler).await;

    f.queue.send(json!({}), Duration::ZERO).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let err = f.worker.stop().await.unwrap_err();
    assert!(matches!(err, WorkerError::ShutdownTimeout(1)));
    assert_eq!(f.registry.stopped_writes(), 1);
}

// ============================================
// Store Failures
// ============================================

#[tokio::test(start_paused = true)]
async fn test_dropped_queue_is_fatal_and_reported() {
    let f = start_worker(
        WorkerConfig::new("tasks"),
        handler_fn(|_, _| async { Ok(()) }),
    )
    .await;

    f.queue.drop_queue().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let status = f.worker.status();
    assert!(!status.polling);
    assert!(matches!(status.last_error, Some(QueueError::QueueNotFound(_))));

    let err = f.worker.stop().await.unwrap_err();
    assert!(matches!(err, WorkerError::Queue(QueueError::QueueNotFound(_))));
    assert_eq!(f.registry.stopped_writes(), 1);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_fatal_store_error_reaches_host_and_silences_heartbeat() {
    let f = start_worker(
        WorkerConfig::new("tasks"),
        handler_fn(|_, _| async { Ok(()) }),
    )
    .await;
    assert!(f.worker.status().accepting_work);

    f.queue.drop_queue().await.unwrap();

    let exit = tokio::time::timeout(Duration::from_secs(10), f.worker.closed())
        .await
        .expect("closed() resolves after a fatal error");
    assert!(matches!(exit, Err(QueueError::QueueNotFound(_))));

    let status = f.worker.status();
    assert_eq!(status.state, LifecycleState::Running);
    assert!(!status.accepting_work);
    assert!(!status.polling);

    let heartbeats = f.registry.heartbeat_count();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(f.registry.heartbeat_count(), heartbeats);

    let err = f.worker.stop().await.unwrap_err();
    assert!(matches!(err, WorkerError::Queue(QueueError::QueueNotFound(_))));
    assert_eq!(f.registry.stopped_writes(), 1);
    assert!(f.worker.closed().await.is_err());
}

#[tokio::test]
async fn test_archive_twice_is_not_an_error() {
    let queue = InMemoryQueue::created("tasks");
    let id = queue.send(json!({}), Duration::ZERO).await.unwrap();

    assert!(queue.archive(id).await.unwrap());
    assert!(!queue.archive(id).await.unwrap());
}
