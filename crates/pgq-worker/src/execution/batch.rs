//! The poll, admit, execute loop

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::controller::ExecutionController;
use super::executor::ExecutionTask;
use super::poller::Poller;
use crate::lifecycle::{LifecycleState, WorkerLifecycle};
use crate::queue::QueueError;

/// Why the batch loop ended without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchExit {
    /// The root cancellation token fired
    Cancelled,
    /// The lifecycle stopped accepting work
    NotAccepting(LifecycleState),
}

/// Feeds leased messages into the execution controller
///
/// Polls only while the lifecycle accepts work and a slot is free, and never
/// leases more messages than there are free slots. Stopping the loop never
/// aborts executions that were already submitted.
pub struct BatchProcessor {
    poller: Poller,
    controller: Arc<ExecutionController>,
    lifecycle: Arc<WorkerLifecycle>,
    cancellation: CancellationToken,
    error_backoff: Duration,
}

impl BatchProcessor {
    pub fn new(
        poller: Poller,
        controller: Arc<ExecutionController>,
        lifecycle: Arc<WorkerLifecycle>,
        cancellation: CancellationToken,
        error_backoff: Duration,
    ) -> Self {
        Self {
            poller,
            controller,
            lifecycle,
            cancellation,
            error_backoff,
        }
    }

    /// Run until cancelled, no longer accepting work, or a fatal store error
    #[instrument(skip_all, fields(worker_id = %self.lifecycle.worker_id()))]
    pub async fn run(self) -> Result<BatchExit, QueueError> {
        let mut state_rx = self.lifecycle.subscribe();
        let mut submitted: u64 = 0;

        let exit = loop {
            if self.cancellation.is_cancelled() {
                break BatchExit::Cancelled;
            }
            if !self.lifecycle.is_accepting_work() {
                break BatchExit::NotAccepting(self.lifecycle.state());
            }

            if self.controller.available_slots() == 0 {
                tokio::select! {
                    biased;
                    _ = self.cancellation.cancelled() => {}
                    _ = state_rx.changed() => {}
                    _ = self.controller.wait_for_slot() => {}
                }
                continue;
            }

            let free = self.controller.available_slots();
            let batch = match self.poller.poll_up_to(free).await {
                Ok(batch) => batch,
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "poll failed, retrying");
                    self.poller.wait(self.error_backoff).await;
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "poll failed, stopping batch loop");
                    return Err(e);
                }
            };

            if !batch.is_empty() {
                debug!(count = batch.len(), free, "dispatching batch");
            }

            // Leased messages are ours even if shutdown began meanwhile
            for message in batch {
                let task = ExecutionTask::new(message, self.cancellation.child_token());
                if self.controller.submit(task).await.is_err() {
                    warn!("execution controller closed, leaving remaining messages to lease expiry");
                    return Ok(BatchExit::Cancelled);
                }
                submitted += 1;
            }
        };

        info!(?exit, submitted, "batch loop finished");
        Ok(exit)
    }
}
