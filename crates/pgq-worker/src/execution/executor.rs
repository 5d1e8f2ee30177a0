//! Single-message execution: handler invocation and outcome resolution

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use crate::queue::{MessageQueue, QueueError, QueuedMessage};
use crate::reliability::RetryConfig;

/// Retries of a store call after the handler has returned
const STORE_RETRIES: u32 = 3;

/// Linear backoff step between store call retries
const STORE_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Future returned by a [`MessageHandler`]
pub type HandlerFuture = BoxFuture<'static, anyhow::Result<()>>;

/// User handler invoked once per leased message
pub type MessageHandler =
    Arc<dyn Fn(serde_json::Value, HandlerContext) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure into a [`MessageHandler`]
///
/// # Example
///
/// ```
/// use pgq_worker::execution::handler_fn;
///
/// let handler = handler_fn(|payload, ctx| async move {
///     tracing::info!(msg_id = ctx.msg_id, %payload, "handling");
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(handler: F) -> MessageHandler
where
    F: Fn(serde_json::Value, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |payload, ctx| Box::pin(handler(payload, ctx)))
}

/// What a handler gets to see besides the payload
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub msg_id: i64,
    /// 1-based attempt number of this invocation
    pub attempt: u32,
    /// Fires when the worker shuts down; observing it is up to the handler
    pub cancellation: CancellationToken,
}

impl HandlerContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once the worker starts shutting down
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }
}

/// A leased message on its way to the handler
#[derive(Debug, Clone)]
pub struct ExecutionTask {
    pub message: QueuedMessage,
    pub cancellation: CancellationToken,
}

impl ExecutionTask {
    pub fn new(message: QueuedMessage, cancellation: CancellationToken) -> Self {
        Self {
            message,
            cancellation,
        }
    }
}

/// Errors from one handler invocation
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// The handler returned an error
    #[error("handler failed: {0:#}")]
    Handler(anyhow::Error),

    /// The handler panicked
    #[error("handler panicked: {0}")]
    Panicked(String),
}

/// How a dispatch was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Handler succeeded, message archived
    Completed,
    /// Handler failed, message hidden until the next attempt
    Retrying { delay_seconds: u64 },
    /// Handler failed on its last attempt, message archived
    Abandoned,
    /// The store could not be updated; the lease will expire and redeliver
    Unresolved,
}

/// Runs one message through the handler and settles it in the queue
///
/// Exactly one handler invocation happens per [`run`](Self::run), regardless
/// of how many times the follow-up store call is retried.
pub struct MessageExecutor {
    queue: Arc<dyn MessageQueue>,
    handler: MessageHandler,
    retry: RetryConfig,
}

impl MessageExecutor {
    pub fn new(queue: Arc<dyn MessageQueue>, handler: MessageHandler, retry: RetryConfig) -> Self {
        Self {
            queue,
            handler,
            retry,
        }
    }

    /// Execute a task and resolve its outcome
    #[instrument(skip_all, fields(msg_id = task.message.id, attempt = task.message.attempt()))]
    pub async fn run(&self, task: ExecutionTask) -> ExecutionOutcome {
        let msg_id = task.message.id;
        let attempt = task.message.attempt();
        let ctx = HandlerContext {
            msg_id,
            attempt,
            cancellation: task.cancellation,
        };

        let error = match self.invoke(task.message.payload, ctx).await {
            Ok(()) => {
                let archived = self
                    .with_store_retries("archive", || self.queue.archive(msg_id))
                    .await;
                return match archived {
                    Ok(_) => {
                        debug!("message completed");
                        ExecutionOutcome::Completed
                    }
                    Err(e) => self.unresolved("archive", &e),
                };
            }
            Err(error) => error,
        };

        if self.retry.has_attempts_remaining(attempt) {
            let delay_seconds = self.retry.delay_for(attempt);
            warn!(delay_seconds, error = %error, "handler failed, retrying");

            match self
                .with_store_retries("delay_retry", || self.queue.delay_retry(msg_id, delay_seconds))
                .await
            {
                Ok(Some(_)) => ExecutionOutcome::Retrying { delay_seconds },
                Ok(None) => {
                    debug!("message vanished before it could be delayed");
                    ExecutionOutcome::Unresolved
                }
                Err(e) => self.unresolved("delay_retry", &e),
            }
        } else {
            error!(limit = self.retry.limit, error = %error, "retries exhausted, abandoning message");

            match self.with_store_retries("archive", || self.queue.archive(msg_id)).await {
                Ok(_) => ExecutionOutcome::Abandoned,
                Err(e) => self.unresolved("archive", &e),
            }
        }
    }

    async fn invoke(
        &self,
        payload: serde_json::Value,
        ctx: HandlerContext,
    ) -> Result<(), ExecutionError> {
        let handler = Arc::clone(&self.handler);

        // The handler call itself may panic before returning a future
        match AssertUnwindSafe(async move { handler(payload, ctx).await })
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ExecutionError::Handler(e)),
            Err(panic) => Err(ExecutionError::Panicked(panic_message(panic.as_ref()))),
        }
    }

    async fn with_store_retries<T, F, Fut>(
        &self,
        operation: &'static str,
        mut call: F,
    ) -> Result<T, QueueError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, QueueError>>,
    {
        let mut retries = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && retries < STORE_RETRIES => {
                    retries += 1;
                    warn!(operation, retries, error = %e, "transient store error, retrying");
                    tokio::time::sleep(STORE_RETRY_BACKOFF * retries).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn unresolved(&self, operation: &'static str, e: &QueueError) -> ExecutionOutcome {
        error!(operation, error = %e, "could not settle message, leaving it to lease expiry");
        ExecutionOutcome::Unresolved
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
