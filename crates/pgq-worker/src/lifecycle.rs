//! Worker lifecycle: registration, heartbeats and deprecation
//!
//! ```text
//! Starting ──► Running ──► Deprecated
//!    │            │            │
//!    └────────────┴─────► Stopped ◄┘
//! ```
//!
//! Deprecation is only ever observed through the heartbeat, so it takes
//! effect at most one heartbeat interval after an operator sets it.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use crate::registry::{RegistryError, WorkerRegistry};

/// Process-local worker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Constructed, not registered yet
    Starting,
    /// Registered and accepting work
    Running,
    /// Asked to step down; finishing in-flight work only
    Deprecated,
    /// Shut down
    Stopped,
}

impl LifecycleState {
    /// Whether the state machine allows moving to `next`
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Starting, Running)
                | (Starting, Stopped)
                | (Running, Deprecated)
                | (Running, Stopped)
                | (Deprecated, Stopped)
        )
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Deprecated => write!(f, "deprecated"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Lifecycle errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum LifecycleError {
    #[error("invalid lifecycle transition from {from} to {to}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Registration, heartbeat and state machine of one worker
///
/// The heartbeat runs on its own cancellation token so that it can be torn
/// down by [`stop`](Self::stop) independently of the worker's root token.
pub struct WorkerLifecycle {
    worker_id: Uuid,
    queue_name: String,
    registry: Arc<dyn WorkerRegistry>,
    heartbeat_interval: Duration,
    state: Arc<watch::Sender<LifecycleState>>,
    heartbeat_token: CancellationToken,
    heartbeat_handle: Mutex<Option<JoinHandle<()>>>,
    stop_lock: tokio::sync::Mutex<()>,
}

impl WorkerLifecycle {
    pub fn new(
        worker_id: Uuid,
        queue_name: impl Into<String>,
        registry: Arc<dyn WorkerRegistry>,
        heartbeat_interval: Duration,
    ) -> Self {
        let (state, _) = watch::channel(LifecycleState::Starting);
        Self {
            worker_id,
            queue_name: queue_name.into(),
            registry,
            heartbeat_interval,
            state: Arc::new(state),
            heartbeat_token: CancellationToken::new(),
            heartbeat_handle: Mutex::new(None),
            stop_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn worker_id(&self) -> Uuid {
        self.worker_id
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Current state
    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// True only while Running
    pub fn is_accepting_work(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// Register the worker and start heartbeating
    #[instrument(skip(self), fields(worker_id = %self.worker_id, queue = %self.queue_name))]
    pub async fn start(&self) -> Result<(), LifecycleError> {
        let current = self.state();
        if current != LifecycleState::Starting {
            return Err(LifecycleError::InvalidTransition {
                from: current,
                to: LifecycleState::Running,
            });
        }

        self.registry
            .register(self.worker_id, &self.queue_name)
            .await?;
        transition(&self.state, LifecycleState::Running)?;

        let handle = tokio::spawn(heartbeat_loop(
            self.worker_id,
            Arc::clone(&self.registry),
            Arc::clone(&self.state),
            self.heartbeat_interval,
            self.heartbeat_token.clone(),
        ));
        *self.heartbeat_handle.lock() = Some(handle);

        info!(
            heartbeat_interval_ms = self.heartbeat_interval.as_millis() as u64,
            "worker running"
        );
        Ok(())
    }

    /// Stop heartbeating, write `stopped_at` and move to Stopped
    ///
    /// Idempotent. Calling it before [`start`](Self::start) only moves the
    /// state to Stopped. If the registry write fails the state is left as is
    /// and the call can be retried.
    #[instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn stop(&self) -> Result<(), LifecycleError> {
        let _serialized = self.stop_lock.lock().await;

        match self.state() {
            LifecycleState::Stopped => {
                debug!("already stopped");
                return Ok(());
            }
            LifecycleState::Starting => {
                transition(&self.state, LifecycleState::Stopped)?;
                debug!("stopped before start");
                return Ok(());
            }
            LifecycleState::Running | LifecycleState::Deprecated => {}
        }

        self.heartbeat_token.cancel();
        let handle = self.heartbeat_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("heartbeat task ended abnormally: {}", e);
            }
        }

        let written = self.registry.mark_stopped(self.worker_id).await?;
        if !written {
            debug!("stopped_at was already set");
        }

        transition(&self.state, LifecycleState::Stopped)?;
        info!("worker stopped");
        Ok(())
    }
    /// Stop heartbeating without leaving the current state
    ///
    /// Used when the worker can no longer lease messages: its heartbeat goes
    /// stale so monitors see it as dead. [`stop`](Self::stop) still writes
    /// `stopped_at` afterwards.
    pub fn suspend_heartbeat(&self) {
        if !self.heartbeat_token.is_cancelled() {
            warn!(worker_id = %self.worker_id, "suspending heartbeats");
            self.heartbeat_token.cancel();
        }
    }
}

impl Drop for WorkerLifecycle {
    fn drop(&mut self) {
        self.heartbeat_token.cancel();
    }
}

/// Apply a transition atomically, rejecting the ones the state machine forbids
fn transition(
    state: &watch::Sender<LifecycleState>,
    to: LifecycleState,
) -> Result<LifecycleState, LifecycleError> {
    let mut from = to;
    let changed = state.send_if_modified(|current| {
        from = *current;
        if from.can_transition_to(to) {
            *current = to;
            true
        } else {
            false
        }
    });

    if changed {
        Ok(from)
    } else {
        Err(LifecycleError::InvalidTransition { from, to })
    }
}

async fn heartbeat_loop(
    worker_id: Uuid,
    registry: Arc<dyn WorkerRegistry>,
    state: Arc<watch::Sender<LifecycleState>>,
    interval: Duration,
    token: CancellationToken,
) {
    // Registration already wrote the first heartbeat
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!(%worker_id, "heartbeat loop: shutdown requested");
                break;
            }
            _ = ticker.tick() => {
                match registry.heartbeat(worker_id).await {
                    Ok(response) if response.should_deprecate() => {
                        // Only Running may move to Deprecated; repeats are ignored
                        if transition(&state, LifecycleState::Deprecated).is_ok() {
                            info!(
                                %worker_id,
                                deprecated_at = ?response.deprecated_at,
                                "worker deprecated, no longer accepting work"
                            );
                        }
                    }
                    Ok(_) => trace!(%worker_id, "heartbeat"),
                    Err(e) => warn!(%worker_id, error = %e, "heartbeat failed, retrying next tick"),
                }
            }
        }
    }

    debug!(%worker_id, "heartbeat loop exited");
}
