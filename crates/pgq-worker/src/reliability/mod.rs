//! Reliability patterns for message processing
//!
//! This module provides:
//! - [`RetryPolicy`] - Retry configuration validation and backoff calculation
//! - [`RetryConfig`] - Validated fixed or exponential retry settings

mod retry;

pub use retry::{
    RetryConfig, RetryPolicy, RetrySettings, RetryStrategy, DEFAULT_MAX_DELAY_SECONDS,
};
