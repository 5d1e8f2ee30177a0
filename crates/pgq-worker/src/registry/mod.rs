//! Worker registry
//!
//! This module provides:
//! - [`WorkerRegistry`] trait over the `workers` table
//! - [`PostgresWorkerRegistry`] for production
//! - [`InMemoryWorkerRegistry`] for testing

mod memory;
mod postgres;
mod store;

pub use memory::{InMemoryWorkerRegistry, RegistryOp};
pub use postgres::PostgresWorkerRegistry;
pub use store::{HeartbeatResponse, RegistryError, WorkerRecord, WorkerRegistry};
