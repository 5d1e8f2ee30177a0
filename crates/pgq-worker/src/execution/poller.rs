//! Cancellable leasing of message batches

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

use crate::config::WorkerConfig;
use crate::queue::{MessageQueue, QueueError, QueuedMessage, ReadParams};

/// Leases batches from the queue, one `read_with_poll` per call
///
/// Every poll is bounded by the configured poll budget and returns an empty
/// batch as soon as the cancellation token fires.
pub struct Poller {
    queue: Arc<dyn MessageQueue>,
    params: ReadParams,
    cancellation: CancellationToken,
}

impl Poller {
    /// Create a poller from the worker configuration
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        config: &WorkerConfig,
        cancellation: CancellationToken,
    ) -> Self {
        Self::with_params(queue, read_params(config), cancellation)
    }

    /// Create a poller with explicit read parameters
    pub fn with_params(
        queue: Arc<dyn MessageQueue>,
        params: ReadParams,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            queue,
            params,
            cancellation,
        }
    }

    pub fn params(&self) -> &ReadParams {
        &self.params
    }

    /// Lease up to the configured batch size
    pub async fn poll(&self) -> Result<Vec<QueuedMessage>, QueueError> {
        self.poll_up_to(self.params.batch_size).await
    }

    /// Lease at most `max` messages, never more than the configured batch size
    #[instrument(skip(self), fields(queue = %self.queue.queue_name()))]
    pub async fn poll_up_to(&self, max: usize) -> Result<Vec<QueuedMessage>, QueueError> {
        if self.cancellation.is_cancelled() {
            debug!("poller cancelled");
            return Ok(Vec::new());
        }
        if max == 0 {
            return Ok(Vec::new());
        }

        let params = ReadParams {
            batch_size: max.min(self.params.batch_size),
            ..self.params
        };

        // A finished read wins over cancellation: its rows are already leased
        tokio::select! {
            biased;
            result = self.queue.read_with_poll(params) => {
                let messages = result?;
                trace!(count = messages.len(), "poll finished");
                Ok(messages)
            }
            _ = self.cancellation.cancelled() => {
                debug!("poll interrupted by cancellation");
                Ok(Vec::new())
            }
        }
    }

    /// Sleep for `duration`
    ///
    /// Returns `true` if cancellation cut the wait short.
    pub async fn wait(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.cancellation.cancelled() => {
                debug!("cancelled during wait");
                true
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Read parameters derived from a validated configuration
pub fn read_params(config: &WorkerConfig) -> ReadParams {
    ReadParams {
        batch_size: config.batch_size,
        max_poll_duration: config.max_poll_duration(),
        poll_interval: config.poll_interval(),
        visibility_timeout: config.visibility_timeout(),
    }
}
