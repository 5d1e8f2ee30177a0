//! # pgq-worker
//!
//! A PostgreSQL-backed task queue worker built on [pgmq](https://github.com/tembo-io/pgmq).
//!
//! ## Features
//!
//! - **Lease-based delivery**: messages are leased with a visibility timeout; lease expiry is the
//!   only redelivery mechanism, giving at-least-once processing
//! - **Bounded concurrency**: never more than `max_concurrent` handlers in flight
//! - **Retries**: fixed or capped exponential backoff, driven by the store's read count
//! - **Rolling deploys**: operators deprecate a worker through the `workers` table; it stops
//!   leasing within one heartbeat and lets in-flight work finish
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     WorkerLifecycle                          │
//! │  (registration, heartbeat, deprecation → gates polling)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │        BatchProcessor → Poller → ExecutionController         │
//! │  (lease up to the free slots, admit, spawn executions)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    MessageExecutor                           │
//! │  (run handler once, then archive / delay / abandon)         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use pgq_worker::prelude::*;
//!
//! let config = WorkerConfig::new("emails")
//!     .with_max_concurrent(20)
//!     .with_retry(RetryConfig::exponential(5, 2).with_max_delay_seconds(120));
//!
//! let handler = handler_fn(|payload, ctx| async move {
//!     tracing::info!(msg_id = ctx.msg_id, attempt = ctx.attempt, "sending email");
//!     send_email(payload).await
//! });
//!
//! let worker = Worker::connect(&database_url, config, handler).await?;
//! worker.start(uuid::Uuid::now_v7()).await?;
//!
//! tokio::signal::ctrl_c().await?;
//! worker.stop().await?;
//! ```

pub mod config;
pub mod execution;
pub mod lifecycle;
pub mod pg;
pub mod queue;
pub mod registry;
pub mod reliability;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{ConfigError, WorkerConfig, WorkerSettings};
    pub use crate::execution::{handler_fn, HandlerContext, MessageHandler};
    pub use crate::lifecycle::LifecycleState;
    pub use crate::queue::{MessageQueue, PgmqQueue, QueueError, QueuedMessage};
    pub use crate::registry::{PostgresWorkerRegistry, WorkerRecord, WorkerRegistry};
    pub use crate::reliability::{RetryConfig, RetryStrategy};
    pub use crate::worker::{Worker, WorkerError, WorkerStatus};
}

// Re-export key types at crate root
pub use config::{ConfigError, WorkerConfig, WorkerSettings};
pub use execution::{handler_fn, HandlerContext, MessageHandler};
pub use lifecycle::{LifecycleError, LifecycleState, WorkerLifecycle};
pub use queue::{InMemoryQueue, MessageQueue, PgmqQueue, QueueError, QueuedMessage};
pub use registry::{InMemoryWorkerRegistry, PostgresWorkerRegistry, WorkerRecord, WorkerRegistry};
pub use reliability::{RetryConfig, RetryPolicy, RetrySettings, RetryStrategy};
pub use worker::{Worker, WorkerError, WorkerStatus};
