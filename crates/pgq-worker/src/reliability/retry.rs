//! Retry policy implementation

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Cap applied to exponential backoff when no `max_delay_seconds` is given.
pub const DEFAULT_MAX_DELAY_SECONDS: u32 = 300;

/// Backoff strategy between handler attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Same delay before every retry
    Fixed,
    /// Delay doubles with every retry, up to a cap
    Exponential,
}

impl std::fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed => write!(f, "fixed"),
            Self::Exponential => write!(f, "exponential"),
        }
    }
}

/// Retry configuration as it arrives from the outside world.
///
/// Numbers are kept as `f64` and the strategy as a string so that values such
/// as `2.5`, `-1` or `"bogus"` reach [`RetryPolicy::validate`] and get a
/// precise error instead of an opaque deserialization failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetrySettings {
    pub strategy: String,
    pub limit: f64,
    #[serde(alias = "baseDelay")]
    pub base_delay_seconds: f64,
    #[serde(default, alias = "maxDelay", skip_serializing_if = "Option::is_none")]
    pub max_delay_seconds: Option<f64>,
}

impl From<RetryConfig> for RetrySettings {
    fn from(config: RetryConfig) -> Self {
        Self {
            strategy: config.strategy.to_string(),
            limit: config.limit as f64,
            base_delay_seconds: config.base_delay_seconds as f64,
            max_delay_seconds: config.max_delay_seconds.map(f64::from),
        }
    }
}

/// Validated retry configuration
///
/// `limit` is the total number of handler invocations a message gets before
/// it is abandoned; the delay before the `n`-th retry is
/// [`RetryConfig::delay_for`]`(n)`.
///
/// # Example
///
/// ```
/// use pgq_worker::reliability::RetryConfig;
///
/// let config = RetryConfig::exponential(3, 2).with_max_delay_seconds(60);
///
/// assert_eq!(config.delay_for(1), 2);
/// assert_eq!(config.delay_for(2), 4);
/// assert_eq!(config.delay_for(10), 60);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RetrySettings", into = "RetrySettings")]
pub struct RetryConfig {
    pub strategy: RetryStrategy,
    pub limit: u32,
    pub base_delay_seconds: u32,
    pub max_delay_seconds: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::exponential(5, 5)
    }
}

impl RetryConfig {
    /// Fixed delay between attempts
    pub fn fixed(limit: u32, base_delay_seconds: u32) -> Self {
        Self {
            strategy: RetryStrategy::Fixed,
            limit,
            base_delay_seconds,
            max_delay_seconds: None,
        }
    }

    /// Doubling delay between attempts, capped at 300s unless overridden
    pub fn exponential(limit: u32, base_delay_seconds: u32) -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            limit,
            base_delay_seconds,
            max_delay_seconds: None,
        }
    }

    /// Set the exponential backoff cap
    pub fn with_max_delay_seconds(mut self, max: u32) -> Self {
        self.max_delay_seconds = Some(max);
        self
    }

    /// Check the invariants of an already-typed configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        RetryPolicy::validate(&RetrySettings::from(*self)).map(|_| ())
    }

    /// Delay in seconds before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> u64 {
        RetryPolicy::delay_for(attempt, self)
    }

    /// Same as [`delay_for`](Self::delay_for), as a [`Duration`]
    pub fn delay_duration(&self, attempt: u32) -> Duration {
        Duration::from_secs(self.delay_for(attempt))
    }

    /// Whether a message that has been handled `attempt` times gets another go
    pub fn has_attempts_remaining(&self, attempt: u32) -> bool {
        attempt < self.limit
    }
}

impl TryFrom<RetrySettings> for RetryConfig {
    type Error = ConfigError;

    fn try_from(settings: RetrySettings) -> Result<Self, Self::Error> {
        RetryPolicy::validate(&settings)
    }
}

/// Pure retry functions: validation and delay calculation.
pub struct RetryPolicy;

impl RetryPolicy {
    /// Validate loose settings and turn them into a [`RetryConfig`]
    pub fn validate(settings: &RetrySettings) -> Result<RetryConfig, ConfigError> {
        let strategy = match settings.strategy.as_str() {
            "fixed" => RetryStrategy::Fixed,
            "exponential" => RetryStrategy::Exponential,
            other => {
                return Err(ConfigError::invalid_retry(format!(
                    "unknown strategy {other:?}, expected \"fixed\" or \"exponential\""
                )))
            }
        };

        let limit = whole_number(settings.limit)
            .ok_or_else(|| ConfigError::invalid_retry("limit must be a non-negative integer"))?;

        let base_delay_seconds = whole_number(settings.base_delay_seconds)
            .filter(|base| *base > 0)
            .ok_or_else(|| {
                ConfigError::invalid_retry("base_delay_seconds must be a positive integer")
            })?;

        let max_delay_seconds = match (strategy, settings.max_delay_seconds) {
            (_, None) => None,
            (RetryStrategy::Fixed, Some(_)) => {
                return Err(ConfigError::invalid_retry(
                    "max_delay_seconds is only valid for the exponential strategy",
                ))
            }
            (RetryStrategy::Exponential, Some(max)) => {
                let max = whole_number(max).filter(|max| *max > 0).ok_or_else(|| {
                    ConfigError::invalid_retry("max_delay_seconds must be a positive integer")
                })?;
                if max < base_delay_seconds {
                    return Err(ConfigError::invalid_retry(format!(
                        "max_delay_seconds ({max}) must be >= base_delay_seconds ({base_delay_seconds})"
                    )));
                }
                Some(max)
            }
        };

        Ok(RetryConfig {
            strategy,
            limit,
            base_delay_seconds,
            max_delay_seconds,
        })
    }

    /// Delay in whole seconds before retry number `attempt` (1-based).
    ///
    /// Exponential delays saturate at the cap for any `attempt`, however large.
    pub fn delay_for(attempt: u32, config: &RetryConfig) -> u64 {
        let base = u64::from(config.base_delay_seconds);
        match config.strategy {
            RetryStrategy::Fixed => base,
            RetryStrategy::Exponential => {
                let cap = u64::from(config.max_delay_seconds.unwrap_or(DEFAULT_MAX_DELAY_SECONDS));
                let exponent = attempt.saturating_sub(1);
                // base fits in 32 bits, so any shift of 32 or more already exceeds a u32 cap
                if exponent >= 32 {
                    return cap;
                }
                base.checked_shl(exponent).map_or(cap, |delay| delay.min(cap))
            }
        }
    }
}

/// `Some(n)` when `value` is a whole number representable as `u32`
fn whole_number(value: f64) -> Option<u32> {
    if value.is_finite() && value.fract() == 0.0 && (0.0..=u32::MAX as f64).contains(&value) {
        Some(value as u32)
    } else {
        None
    }
}
