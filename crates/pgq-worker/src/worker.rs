//! Worker façade
//!
//! Composes the queue, registry, lifecycle and execution pipeline over one
//! connection pool and exposes `start`, `stop` and `status` to the host.

use std::sync::Arc;

use parking_lot::Mutex;
use sqlx::PgPool;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{ConfigError, WorkerConfig};
use crate::execution::{
    BatchExit, BatchProcessor, ExecutionController, MessageExecutor, MessageHandler, Poller,
};
use crate::lifecycle::{LifecycleError, LifecycleState, WorkerLifecycle};
use crate::pg;
use crate::queue::{MessageQueue, PgmqQueue, QueueError};
use crate::registry::{PostgresWorkerRegistry, WorkerRegistry};

/// Worker errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// `start` was called on a worker that was already started or stopped
    #[error("worker cannot be started from state {0}")]
    NotStartable(LifecycleState),

    /// In-flight executions outlived the shutdown timeout
    #[error("shutdown timed out with {0} executions still running")]
    ShutdownTimeout(usize),
}

/// Point-in-time view of a worker
#[derive(Debug, Clone)]
pub struct WorkerStatus {
    pub worker_id: Option<Uuid>,
    pub queue_name: String,
    pub state: LifecycleState,
    /// Running and still polling
    pub accepting_work: bool,
    /// Whether the batch loop is still leasing messages
    pub polling: bool,
    pub in_flight: usize,
    pub available_slots: usize,
    pub max_concurrent: usize,
    /// Fatal store error that ended the batch loop, if any
    pub last_error: Option<QueueError>,
}

type BatchOutcome = Result<BatchExit, QueueError>;

enum Phase {
    Idle,
    Started {
        lifecycle: Arc<WorkerLifecycle>,
        batch: Option<JoinHandle<BatchOutcome>>,
    },
    StoppedBeforeStart,
}

/// A queue worker
///
/// # Example
///
/// ```ignore
/// use pgq_worker::prelude::*;
///
/// let config = WorkerConfig::new("emails").with_max_concurrent(20);
/// let worker = Worker::connect(&database_url, config, handler_fn(|payload, _ctx| async move {
///     send_email(payload).await
/// }))
/// .await?;
///
/// worker.start(uuid::Uuid::now_v7()).await?;
/// tokio::signal::ctrl_c().await?;
/// worker.stop().await?;
/// ```
pub struct Worker {
    config: WorkerConfig,
    queue: Arc<dyn MessageQueue>,
    registry: Arc<dyn WorkerRegistry>,
    controller: Arc<ExecutionController>,
    root: CancellationToken,
    phase: Mutex<Phase>,
    /// How the batch loop ended, once it has
    exit: Arc<watch::Sender<Option<BatchOutcome>>>,
    /// Serializes `start` and `stop`
    transition_lock: tokio::sync::Mutex<()>,
}

impl Worker {
    /// Build a worker over explicit stores
    ///
    /// The configuration is validated here; an invalid one never produces a
    /// worker.
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        registry: Arc<dyn WorkerRegistry>,
        config: WorkerConfig,
        handler: MessageHandler,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if queue.queue_name() != config.queue_name {
            return Err(ConfigError::invalid(
                "queue_name",
                format!(
                    "queue store is bound to {:?}, configuration names {:?}",
                    queue.queue_name(),
                    config.queue_name
                ),
            ));
        }

        let executor = Arc::new(MessageExecutor::new(
            Arc::clone(&queue),
            handler,
            config.retry,
        ));
        let controller = Arc::new(ExecutionController::new(executor, config.max_concurrent));

        Ok(Self {
            config,
            queue,
            registry,
            controller,
            root: CancellationToken::new(),
            phase: Mutex::new(Phase::Idle),
            exit: Arc::new(watch::channel(None).0),
            transition_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Build a worker over pgmq and the `workers` table of an existing pool
    pub fn from_pool(
        pool: PgPool,
        config: WorkerConfig,
        handler: MessageHandler,
    ) -> Result<Self, ConfigError> {
        let queue = Arc::new(PgmqQueue::new(pool.clone(), config.queue_name.clone()));
        let registry = Arc::new(PostgresWorkerRegistry::new(pool));
        Self::new(queue, registry, config, handler)
    }

    /// Validate the configuration, open a pool sized for it and build a worker
    pub async fn connect(
        database_url: &str,
        config: WorkerConfig,
        handler: MessageHandler,
    ) -> Result<Self, WorkerError> {
        config.validate()?;
        let pool = pg::connect(database_url, &config).await?;
        Ok(Self::from_pool(pool, config, handler)?)
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<dyn MessageQueue> {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<dyn WorkerRegistry> {
        &self.registry
    }

    /// Register under `worker_id` and begin polling
    #[instrument(skip(self), fields(queue = %self.config.queue_name))]
    pub async fn start(&self, worker_id: Uuid) -> Result<(), WorkerError> {
        let _serialized = self.transition_lock.lock().await;

        match &*self.phase.lock() {
            Phase::Idle => {}
            Phase::Started { lifecycle, .. } => {
                return Err(WorkerError::NotStartable(lifecycle.state()))
            }
            Phase::StoppedBeforeStart => {
                return Err(WorkerError::NotStartable(LifecycleState::Stopped))
            }
        }

        self.queue.ensure_exists().await?;

        let lifecycle = Arc::new(WorkerLifecycle::new(
            worker_id,
            self.config.queue_name.clone(),
            Arc::clone(&self.registry),
            self.config.heartbeat_interval,
        ));
        lifecycle.start().await?;

        let processor = BatchProcessor::new(
            Poller::new(Arc::clone(&self.queue), &self.config, self.root.clone()),
            Arc::clone(&self.controller),
            Arc::clone(&lifecycle),
            self.root.clone(),
            self.config.poll_interval(),
        );
        let exit = Arc::clone(&self.exit);
        let heartbeat = Arc::clone(&lifecycle);
        let batch = tokio::spawn(async move {
            let result = processor.run().await;
            if let Err(e) = &result {
                // Nothing will be leased again; let the heartbeat go stale
                error!(error = %e, "polling ended on a fatal store error");
                heartbeat.suspend_heartbeat();
            }
            exit.send_replace(Some(result.clone()));
            result
        });

        *self.phase.lock() = Phase::Started {
            lifecycle,
            batch: Some(batch),
        };

        info!(
            %worker_id,
            max_concurrent = self.config.max_concurrent,
            batch_size = self.config.batch_size,
            "worker started"
        );
        Ok(())
    }

    /// Stop polling, drain in-flight work and mark the worker stopped
    ///
    /// Idempotent. Returns the fatal store error that ended polling, if any,
    /// or [`WorkerError::ShutdownTimeout`] when executions outlived
    /// `shutdown_timeout`; `stopped_at` is written in either case.
    #[instrument(skip(self), fields(queue = %self.config.queue_name))]
    pub async fn stop(&self) -> Result<(), WorkerError> {
        let _serialized = self.transition_lock.lock().await;

        let (lifecycle, batch) = {
            let mut phase = self.phase.lock();
            if matches!(*phase, Phase::Idle) {
                *phase = Phase::StoppedBeforeStart;
                self.record_exit(BatchExit::Cancelled);
                return Ok(());
            }
            match &mut *phase {
                Phase::Started { lifecycle, batch } => (Arc::clone(lifecycle), batch.take()),
                Phase::Idle | Phase::StoppedBeforeStart => return Ok(()),
            }
        };

        self.root.cancel();

        let mut failure = None;
        if let Some(batch) = batch {
            match batch.await {
                Ok(Ok(exit)) => info!(?exit, "batch loop stopped"),
                Ok(Err(e)) => failure = Some(WorkerError::Queue(e)),
                Err(e) => error!("batch loop task failed: {}", e),
            }
        }
        self.record_exit(BatchExit::Cancelled);

        if !self.controller.drain(self.config.shutdown_timeout).await {
            let remaining = self.controller.in_flight();
            warn!(remaining, "stopping with executions still running");
            failure.get_or_insert(WorkerError::ShutdownTimeout(remaining));
        }

        lifecycle.stop().await?;

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Wait until the batch loop has ended and return why
    ///
    /// Resolves once polling stops for good: after [`stop`](Self::stop), on
    /// deprecation, or with the fatal store error that ended it. The host is
    /// expected to call `stop()` next. Stays pending on a worker that has not
    /// been started.
    pub async fn closed(&self) -> Result<BatchExit, QueueError> {
        let mut rx = self.exit.subscribe();
        let exit = match rx.wait_for(Option::is_some).await {
            Ok(exit) => exit.clone(),
            Err(_) => None,
        };
        exit.unwrap_or(Ok(BatchExit::Cancelled))
    }

    /// Resolve `closed()` for a loop that ended without reporting
    fn record_exit(&self, exit: BatchExit) {
        self.exit.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(Ok(exit));
            true
        });
    }

    /// Current state of the worker
    pub fn status(&self) -> WorkerStatus {
        let (worker_id, state, polling) = match &*self.phase.lock() {
            Phase::Idle => (None, LifecycleState::Starting, false),
            Phase::StoppedBeforeStart => (None, LifecycleState::Stopped, false),
            Phase::Started { lifecycle, batch } => (
                Some(lifecycle.worker_id()),
                lifecycle.state(),
                batch.as_ref().is_some_and(|b| !b.is_finished()),
            ),
        };

        WorkerStatus {
            worker_id,
            queue_name: self.config.queue_name.clone(),
            state,
            accepting_work: state == LifecycleState::Running && polling,
            polling,
            in_flight: self.controller.in_flight(),
            available_slots: self.controller.available_slots(),
            max_concurrent: self.controller.max_concurrent(),
            last_error: match &*self.exit.borrow() {
                Some(Err(e)) => Some(e.clone()),
                _ => None,
            },
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.root.cancel();
    }
}
