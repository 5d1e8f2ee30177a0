//! Lease-based message queue
//!
//! This module provides:
//! - [`MessageQueue`] trait over the read/archive/set-visibility primitives
//! - [`PgmqQueue`] for production, backed by the pgmq SQL functions
//! - [`InMemoryQueue`] for testing

mod memory;
mod postgres;
mod store;

pub use memory::{InMemoryQueue, LeaseRecord, QueueOp};
pub use postgres::PgmqQueue;
pub use store::{MessageQueue, QueueError, QueuedMessage, ReadParams};
