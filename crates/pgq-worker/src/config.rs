//! Worker configuration
//!
//! [`WorkerConfig`] is the validated form used at runtime. It can be built in
//! code through the `with_*` builders, deserialized from JSON (through the
//! loose [`WorkerSettings`] shape, which also understands the legacy flat
//! `retryLimit`/`retryDelay` pair), or read from `PGQ_*` environment variables.

use std::sync::Once;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::reliability::{RetryConfig, RetrySettings};

/// Longest queue name pgmq accepts (its table names get a prefix).
pub const MAX_QUEUE_NAME_LEN: usize = 47;

static LEGACY_RETRY_WARNING: Once = Once::new();

/// Configuration errors. Always raised at construction, never at runtime.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Invalid retry configuration
    #[error("invalid retry configuration: {0}")]
    InvalidRetry(String),

    /// Invalid numeric or naming option
    #[error("invalid option `{option}`: {reason}")]
    InvalidOption {
        option: &'static str,
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid_retry(reason: impl Into<String>) -> Self {
        Self::InvalidRetry(reason.into())
    }

    pub(crate) fn invalid(option: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidOption {
            option,
            reason: reason.into(),
        }
    }
}

/// Validated worker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WorkerSettings", into = "WorkerSettings")]
pub struct WorkerConfig {
    /// Queue to consume
    pub queue_name: String,

    /// Maximum concurrent handler invocations
    pub max_concurrent: usize,

    /// Size of the database connection pool
    pub max_pg_connections: u32,

    /// Upper bound of a single `read_with_poll` call, in seconds
    pub max_poll_seconds: u32,

    /// Spacing of re-checks inside one `read_with_poll` call
    pub poll_interval_ms: u32,

    /// Lease duration of a read message, in seconds
    pub visibility_timeout_seconds: u32,

    /// Messages requested per poll
    pub batch_size: usize,

    /// Retry behaviour for failing handlers
    pub retry: RetryConfig,

    /// Heartbeat period of the worker record
    pub heartbeat_interval: Duration,

    /// How long `stop()` waits for in-flight handlers
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_name: "tasks".to_string(),
            max_concurrent: 10,
            max_pg_connections: 4,
            max_poll_seconds: 5,
            poll_interval_ms: 200,
            visibility_timeout_seconds: 3,
            batch_size: 10,
            retry: RetryConfig::default(),
            heartbeat_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    /// Create a configuration for the given queue with default settings
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            ..Default::default()
        }
    }

    /// Set the maximum concurrency. Also resizes the batch when it was tracking
    /// the previous concurrency.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        if self.batch_size == self.max_concurrent {
            self.batch_size = max;
        }
        self.max_concurrent = max;
        self
    }

    /// Set the connection pool size
    pub fn with_max_pg_connections(mut self, max: u32) -> Self {
        self.max_pg_connections = max;
        self
    }

    /// Set the upper bound of a single poll
    pub fn with_max_poll_seconds(mut self, seconds: u32) -> Self {
        self.max_poll_seconds = seconds;
        self
    }

    /// Set the interval between re-checks during a poll
    pub fn with_poll_interval_ms(mut self, millis: u32) -> Self {
        self.poll_interval_ms = millis;
        self
    }

    /// Set the message lease duration
    pub fn with_visibility_timeout_seconds(mut self, seconds: u32) -> Self {
        self.visibility_timeout_seconds = seconds;
        self
    }

    /// Set the number of messages requested per poll
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the retry configuration
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Use the deprecated flat retry options (`retryLimit`/`retryDelay`).
    ///
    /// Equivalent to `with_retry(RetryConfig::fixed(limit, delay))`; logs a
    /// deprecation warning once per process.
    pub fn with_legacy_retry(self, retry_limit: u32, retry_delay_seconds: u32) -> Self {
        warn_legacy_retry();
        self.with_retry(RetryConfig::fixed(retry_limit, retry_delay_seconds))
    }

    /// Set the heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the graceful shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Upper bound of a single poll
    pub fn max_poll_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.max_poll_seconds))
    }

    /// Interval between re-checks inside a poll
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(u64::from(self.poll_interval_ms))
    }

    /// Message lease duration
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.visibility_timeout_seconds))
    }

    /// Validate every option
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_queue_name(&self.queue_name)?;

        if self.max_concurrent == 0 {
            return Err(ConfigError::invalid("max_concurrent", "must be at least 1"));
        }
        if self.max_pg_connections == 0 {
            return Err(ConfigError::invalid(
                "max_pg_connections",
                "must be at least 1",
            ));
        }
        if self.max_poll_seconds == 0 {
            return Err(ConfigError::invalid("max_poll_seconds", "must be at least 1"));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::invalid("poll_interval_ms", "must be at least 1"));
        }
        if u64::from(self.poll_interval_ms) > u64::from(self.max_poll_seconds) * 1000 {
            return Err(ConfigError::invalid(
                "poll_interval_ms",
                "must not exceed max_poll_seconds",
            ));
        }
        if self.visibility_timeout_seconds == 0 {
            return Err(ConfigError::invalid(
                "visibility_timeout_seconds",
                "must be at least 1",
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("batch_size", "must be at least 1"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::invalid(
                "heartbeat_interval",
                "must be greater than zero",
            ));
        }

        self.retry.validate()
    }

    /// Create configuration from environment variables
    ///
    /// Reads `PGQ_QUEUE_NAME`, `PGQ_MAX_CONCURRENT`, `PGQ_MAX_PG_CONNECTIONS`,
    /// `PGQ_MAX_POLL_SECONDS`, `PGQ_POLL_INTERVAL_MS`,
    /// `PGQ_VISIBILITY_TIMEOUT_SECONDS`, `PGQ_BATCH_SIZE`, `PGQ_RETRY` (JSON
    /// retry object), the legacy `PGQ_RETRY_LIMIT`/`PGQ_RETRY_DELAY` pair,
    /// `PGQ_HEARTBEAT_INTERVAL_MS` and `PGQ_SHUTDOWN_TIMEOUT_MS`. Unset
    /// variables fall back to defaults; unparsable ones are an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        fn number<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &'static str,
        ) -> Result<Option<T>, ConfigError> {
            lookup(key)
                .map(|raw| {
                    raw.trim()
                        .parse::<T>()
                        .map_err(|_| ConfigError::invalid(key, format!("cannot parse {raw:?}")))
                })
                .transpose()
        }

        let retry = lookup("PGQ_RETRY")
            .map(|raw| {
                serde_json::from_str::<RetrySettings>(&raw)
                    .map_err(|e| ConfigError::invalid_retry(e.to_string()))
            })
            .transpose()?;

        let settings = WorkerSettings {
            queue_name: lookup("PGQ_QUEUE_NAME"),
            max_concurrent: number(&lookup, "PGQ_MAX_CONCURRENT")?,
            max_pg_connections: number(&lookup, "PGQ_MAX_PG_CONNECTIONS")?,
            max_poll_seconds: number(&lookup, "PGQ_MAX_POLL_SECONDS")?,
            poll_interval_ms: number(&lookup, "PGQ_POLL_INTERVAL_MS")?,
            visibility_timeout_seconds: number(&lookup, "PGQ_VISIBILITY_TIMEOUT_SECONDS")?,
            batch_size: number(&lookup, "PGQ_BATCH_SIZE")?,
            retry,
            retry_limit: number(&lookup, "PGQ_RETRY_LIMIT")?,
            retry_delay: number(&lookup, "PGQ_RETRY_DELAY")?,
            heartbeat_interval_ms: number(&lookup, "PGQ_HEARTBEAT_INTERVAL_MS")?,
            shutdown_timeout_ms: number(&lookup, "PGQ_SHUTDOWN_TIMEOUT_MS")?,
        };

        Self::try_from(settings)
    }
}

/// Loose, deserializable worker options
///
/// Every field is optional; missing ones take the defaults of
/// [`WorkerConfig`]. `retry_limit`/`retry_delay` are the deprecated flat
/// retry options and are only honoured when `retry` is absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_pg_connections: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_poll_seconds: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visibility_timeout_seconds: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_limit: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_delay: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shutdown_timeout_ms: Option<u64>,
}

impl TryFrom<WorkerSettings> for WorkerConfig {
    type Error = ConfigError;

    fn try_from(settings: WorkerSettings) -> Result<Self, Self::Error> {
        let defaults = WorkerConfig::default();
        let max_concurrent = settings.max_concurrent.unwrap_or(defaults.max_concurrent);

        let retry = match (settings.retry, settings.retry_limit, settings.retry_delay) {
            (Some(retry), legacy_limit, legacy_delay) => {
                if legacy_limit.is_some() || legacy_delay.is_some() {
                    warn!("both `retry` and legacy `retryLimit`/`retryDelay` given; ignoring the legacy options");
                }
                RetryConfig::try_from(retry)?
            }
            (None, None, None) => defaults.retry,
            (None, limit, delay) => {
                warn_legacy_retry();
                let legacy = RetryConfig::fixed(5, 5);
                RetryConfig::try_from(RetrySettings {
                    strategy: "fixed".to_string(),
                    limit: limit.unwrap_or(f64::from(legacy.limit)),
                    base_delay_seconds: delay.unwrap_or(f64::from(legacy.base_delay_seconds)),
                    max_delay_seconds: None,
                })?
            }
        };

        let config = WorkerConfig {
            queue_name: settings.queue_name.unwrap_or(defaults.queue_name),
            max_concurrent,
            max_pg_connections: settings
                .max_pg_connections
                .unwrap_or(defaults.max_pg_connections),
            max_poll_seconds: settings.max_poll_seconds.unwrap_or(defaults.max_poll_seconds),
            poll_interval_ms: settings.poll_interval_ms.unwrap_or(defaults.poll_interval_ms),
            visibility_timeout_seconds: settings
                .visibility_timeout_seconds
                .unwrap_or(defaults.visibility_timeout_seconds),
            batch_size: settings.batch_size.unwrap_or(max_concurrent),
            retry,
            heartbeat_interval: settings
                .heartbeat_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.heartbeat_interval),
            shutdown_timeout: settings
                .shutdown_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.shutdown_timeout),
        };

        config.validate()?;
        Ok(config)
    }
}

impl From<WorkerConfig> for WorkerSettings {
    fn from(config: WorkerConfig) -> Self {
        Self {
            queue_name: Some(config.queue_name),
            max_concurrent: Some(config.max_concurrent),
            max_pg_connections: Some(config.max_pg_connections),
            max_poll_seconds: Some(config.max_poll_seconds),
            poll_interval_ms: Some(config.poll_interval_ms),
            visibility_timeout_seconds: Some(config.visibility_timeout_seconds),
            batch_size: Some(config.batch_size),
            retry: Some(config.retry.into()),
            retry_limit: None,
            retry_delay: None,
            heartbeat_interval_ms: Some(config.heartbeat_interval.as_millis() as u64),
            shutdown_timeout_ms: Some(config.shutdown_timeout.as_millis() as u64),
        }
    }
}

fn warn_legacy_retry() {
    LEGACY_RETRY_WARNING.call_once(|| {
        warn!(
            "`retryLimit`/`retryDelay` are deprecated; use `retry: {{ strategy: \"fixed\", limit, baseDelay }}` instead"
        );
    });
}

fn validate_queue_name(name: &str) -> Result<(), ConfigError> {
    if name.is_empty() {
        return Err(ConfigError::invalid("queue_name", "must not be empty"));
    }
    if name.len() > MAX_QUEUE_NAME_LEN {
        return Err(ConfigError::invalid(
            "queue_name",
            format!("must be at most {MAX_QUEUE_NAME_LEN} characters"),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(ConfigError::invalid(
            "queue_name",
            "may only contain ASCII letters, digits and underscores",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;
    use crate::reliability::RetryStrategy;

    #[test]
    fn test_default_config() {
        let config = WorkerConfig::default();
        assert_eq!(config.queue_name, "tasks");
        assert_eq!(config.max_concurrent, 10);
        assert_eq!(config.max_pg_connections, 4);
        assert_eq!(config.max_poll_seconds, 5);
        assert_eq!(config.poll_interval_ms, 200);
        assert_eq!(config.visibility_timeout_seconds, 3);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = WorkerConfig::new("emails")
            .with_max_concurrent(4)
            .with_max_poll_seconds(2)
            .with_poll_interval_ms(50)
            .with_retry(RetryConfig::fixed(3, 3))
            .with_heartbeat_interval(Duration::from_secs(1));

        assert_eq!(config.queue_name, "emails");
        assert_eq!(config.max_concurrent, 4);
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.poll_interval(), Duration::from_millis(50));
        assert_eq!(config.max_poll_duration(), Duration::from_secs(2));
        assert_eq!(config.retry, RetryConfig::fixed(3, 3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_explicit_batch_size_survives_concurrency_change() {
        let config = WorkerConfig::default()
            .with_batch_size(3)
            .with_max_concurrent(20);
        assert_eq!(config.batch_size, 3);
    }

    #[test]
    fn test_invalid_options_rejected() {
        let cases = [
            WorkerConfig::default().with_max_concurrent(0),
            WorkerConfig::default().with_batch_size(0),
            WorkerConfig::default().with_max_poll_seconds(0),
            WorkerConfig::default().with_poll_interval_ms(0),
            WorkerConfig::default()
                .with_max_poll_seconds(1)
                .with_poll_interval_ms(1500),
            WorkerConfig::default().with_visibility_timeout_seconds(0),
            WorkerConfig::default().with_max_pg_connections(0),
            WorkerConfig::new(""),
            WorkerConfig::new("has-dash"),
            WorkerConfig::new("x".repeat(MAX_QUEUE_NAME_LEN + 1)),
            WorkerConfig::default().with_retry(RetryConfig::fixed(1, 0)),
        ];

        for config in cases {
            assert!(config.validate().is_err(), "expected {config:?} to be rejected");
        }
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: WorkerConfig = serde_json::from_value(json!({
            "queueName": "emails",
            "maxConcurrent": 3,
            "retry": { "strategy": "exponential", "limit": 4, "baseDelay": 2, "maxDelay": 20 }
        }))
        .unwrap();

        assert_eq!(config.queue_name, "emails");
        assert_eq!(config.max_concurrent, 3);
        assert_eq!(config.batch_size, 3);
        assert_eq!(
            config.retry,
            RetryConfig::exponential(4, 2).with_max_delay_seconds(20)
        );
    }

    #[test]
    fn test_legacy_retry_alias() {
        let config: WorkerConfig = serde_json::from_value(json!({
            "retryLimit": 2,
            "retryDelay": 7
        }))
        .unwrap();

        assert_eq!(config.retry.strategy, RetryStrategy::Fixed);
        assert_eq!(config.retry.limit, 2);
        assert_eq!(config.retry.base_delay_seconds, 7);
    }

    #[test]
    fn test_structured_retry_wins_over_legacy() {
        let config: WorkerConfig = serde_json::from_value(json!({
            "retry": { "strategy": "fixed", "limit": 1, "baseDelay": 1 },
            "retryLimit": 9,
            "retryDelay": 9
        }))
        .unwrap();

        assert_eq!(config.retry, RetryConfig::fixed(1, 1));
    }

    #[test]
    fn test_invalid_retry_fails_deserialization() {
        let result = serde_json::from_value::<WorkerConfig>(json!({
            "retry": { "strategy": "bogus", "limit": 1, "baseDelay": 1 }
        }));
        assert!(result.is_err());

        let result = serde_json::from_value::<WorkerConfig>(json!({ "retryLimit": -1 }));
        assert!(result.is_err());
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("PGQ_QUEUE_NAME", "reports"),
            ("PGQ_MAX_CONCURRENT", "6"),
            ("PGQ_POLL_INTERVAL_MS", "100"),
            (
                "PGQ_RETRY",
                r#"{"strategy":"fixed","limit":2,"baseDelaySeconds":4}"#,
            ),
        ]);

        let config =
            WorkerConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();

        assert_eq!(config.queue_name, "reports");
        assert_eq!(config.max_concurrent, 6);
        assert_eq!(config.batch_size, 6);
        assert_eq!(config.poll_interval_ms, 100);
        assert_eq!(config.retry, RetryConfig::fixed(2, 4));
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let result = WorkerConfig::from_lookup(|key| {
            (key == "PGQ_MAX_CONCURRENT").then(|| "lots".to_string())
        });
        assert!(matches!(
            result,
            Err(ConfigError::InvalidOption {
                option: "PGQ_MAX_CONCURRENT",
                ..
            })
        ));
    }

    #[test]
    fn test_serialization_roundtrip() {
        let config = WorkerConfig::new("roundtrip").with_retry(RetryConfig::fixed(2, 2));
        let json = serde_json::to_value(&config).unwrap();
        let parsed: WorkerConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config, parsed);
    }
}
