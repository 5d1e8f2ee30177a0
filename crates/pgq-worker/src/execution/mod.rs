//! Message execution
//!
//! This module provides:
//! - [`MessageExecutor`] running one message through the handler
//! - [`Poller`] leasing batches from the queue
//! - [`ExecutionController`] bounding concurrent executions
//! - [`BatchProcessor`] tying the three together

mod batch;
mod controller;
mod executor;
mod poller;

pub use batch::{BatchExit, BatchProcessor};
pub use controller::{ControllerError, ExecutionController};
pub use executor::{
    handler_fn, ExecutionError, ExecutionOutcome, ExecutionTask, HandlerContext, HandlerFuture,
    MessageExecutor, MessageHandler,
};
pub use poller::{read_params, Poller};
