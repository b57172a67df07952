//! Policy configuration.
//!
//! One [`PolicyConfig`] describes the five policies guarding a single
//! dependency. Registries start from a default `PolicyConfig` and apply a
//! per-instance [`CustomConfig`] over it before the instance is created.
//!
//! Durations accept either integer milliseconds or a human-readable string
//! (`"30s"`, `"250ms"`) when deserialized.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while building or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read policy file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Serde helpers for durations stored as milliseconds.
pub mod duration_ms {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDuration {
        Millis(u64),
        Text(String),
    }

    impl RawDuration {
        fn into_duration(self) -> Result<Duration, humantime::DurationError> {
            match self {
                RawDuration::Millis(ms) => Ok(Duration::from_millis(ms)),
                RawDuration::Text(text) => humantime::parse_duration(text.trim()),
            }
        }
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        RawDuration::deserialize(deserializer)?
            .into_duration()
            .map_err(D::Error::custom)
    }

    /// Same encoding for optional fields.
    pub mod option {
        use super::RawDuration;
        use serde::de::Error as _;
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<RawDuration>::deserialize(deserializer)?
                .map(|raw| raw.into_duration().map_err(D::Error::custom))
                .transpose()
        }
    }
}

/// Circuit breaker thresholds and window sizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    /// Failure rate (percent) at or above which the circuit opens
    pub failure_rate_threshold: f64,

    /// Slow call rate (percent) at or above which the circuit opens
    pub slow_call_rate_threshold: f64,

    /// Calls lasting at least this long count as slow
    #[serde(with = "duration_ms")]
    pub slow_call_duration_threshold: Duration,

    /// Time spent OPEN before trial calls are admitted
    #[serde(with = "duration_ms")]
    pub wait_duration_in_open_state: Duration,

    /// Sliding window size while CLOSED
    pub ring_buffer_size_in_closed_state: usize,

    /// Trial calls admitted while HALF_OPEN
    pub ring_buffer_size_in_half_open_state: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            slow_call_rate_threshold: 100.0,
            slow_call_duration_threshold: Duration::from_secs(60),
            wait_duration_in_open_state: Duration::from_secs(30),
            ring_buffer_size_in_closed_state: 100,
            ring_buffer_size_in_half_open_state: 10,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_percentage("failureRateThreshold", self.failure_rate_threshold)?;
        check_percentage("slowCallRateThreshold", self.slow_call_rate_threshold)?;
        check_positive_duration("slowCallDurationThreshold", self.slow_call_duration_threshold)?;
        check_positive_duration("waitDurationInOpenState", self.wait_duration_in_open_state)?;
        check_nonzero("ringBufferSizeInClosedState", self.ring_buffer_size_in_closed_state)?;
        check_nonzero(
            "ringBufferSizeInHalfOpenState",
            self.ring_buffer_size_in_half_open_state,
        )
    }
}

/// Longest single wait between retry attempts.
pub const MAX_RETRY_WAIT: Duration = Duration::from_secs(60 * 60);

/// Retry attempts and exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    /// Total attempts, including the first call
    pub max_attempts: u32,

    /// Wait before the second attempt
    #[serde(with = "duration_ms")]
    pub base_wait_duration: Duration,

    /// Growth factor applied to the wait on each further attempt
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_wait_duration: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("maxAttempts", "must be at least 1"));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "backoffMultiplier",
                format!("must be >= 1.0, got {}", self.backoff_multiplier),
            ));
        }
        Ok(())
    }

    /// Wait inserted after the given failed attempt (1-based).
    ///
    /// `base * multiplier^(attempt - 1)`, capped at [`MAX_RETRY_WAIT`].
    pub fn wait_after_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_wait_duration.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        // Overflows to infinity for large exponents; that is the cap too
        Duration::try_from_secs_f64(secs).map_or(MAX_RETRY_WAIT, |wait| wait.min(MAX_RETRY_WAIT))
    }
}

/// Concurrency limit per dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BulkheadConfig {
    pub max_concurrent_calls: usize,

    /// How long a caller may queue for a free slot
    #[serde(with = "duration_ms")]
    pub max_wait_duration: Duration,

    /// Callers allowed to queue at once; further callers are rejected
    pub max_wait_queue: usize,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 25,
            max_wait_duration: Duration::from_millis(5000),
            max_wait_queue: 100,
        }
    }
}

impl BulkheadConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_nonzero("maxConcurrentCalls", self.max_concurrent_calls)
    }
}

/// Fixed-window rate limit per dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RateLimiterConfig {
    pub permits_per_window: u32,

    #[serde(with = "duration_ms")]
    pub window_duration: Duration,

    /// How long a caller may wait for the next window; zero fails immediately
    #[serde(with = "duration_ms")]
    pub max_wait: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            permits_per_window: 50,
            window_duration: Duration::from_millis(1000),
            max_wait: Duration::ZERO,
        }
    }
}

impl RateLimiterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.permits_per_window == 0 {
            return Err(ConfigError::invalid("permitsPerWindow", "must be at least 1"));
        }
        check_positive_duration("windowDuration", self.window_duration)
    }

    /// Whether callers fail fast instead of waiting for a refill.
    pub fn is_non_blocking(&self) -> bool {
        self.max_wait.is_zero()
    }
}

/// Per-call time budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TimeLimiterConfig {
    #[serde(with = "duration_ms")]
    pub timeout_duration: Duration,

    /// Signal the operation's cancellation token when the budget is exceeded
    pub cancel_running_future: bool,
}

impl Default for TimeLimiterConfig {
    fn default() -> Self {
        Self {
            timeout_duration: Duration::from_secs(10),
            cancel_running_future: true,
        }
    }
}

impl TimeLimiterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_positive_duration("timeoutDuration", self.timeout_duration)
    }
}

/// Full configuration for one dependency.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PolicyConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub bulkhead: BulkheadConfig,
    pub rate_limiter: RateLimiterConfig,
    pub time_limiter: TimeLimiterConfig,
}

impl PolicyConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.circuit_breaker.validate()?;
        self.retry.validate()?;
        self.bulkhead.validate()?;
        self.rate_limiter.validate()?;
        self.time_limiter.validate()
    }
}

/// Per-instance overrides.
///
/// Every field is optional; unset fields keep the value of the base
/// configuration. Applying the same overrides twice gives the same result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CustomConfig {
    pub failure_rate_threshold: Option<f64>,
    pub slow_call_rate_threshold: Option<f64>,
    #[serde(with = "duration_ms::option", skip_serializing_if = "Option::is_none")]
    pub slow_call_duration_threshold: Option<Duration>,
    #[serde(with = "duration_ms::option", skip_serializing_if = "Option::is_none")]
    pub wait_duration_in_open_state: Option<Duration>,
    pub ring_buffer_size_in_closed_state: Option<usize>,
    pub ring_buffer_size_in_half_open_state: Option<usize>,

    pub max_attempts: Option<u32>,
    #[serde(with = "duration_ms::option", skip_serializing_if = "Option::is_none")]
    pub base_wait_duration: Option<Duration>,
    pub backoff_multiplier: Option<f64>,

    pub max_concurrent_calls: Option<usize>,
    #[serde(with = "duration_ms::option", skip_serializing_if = "Option::is_none")]
    pub max_wait_duration: Option<Duration>,
    pub max_wait_queue: Option<usize>,

    pub permits_per_window: Option<u32>,
    #[serde(with = "duration_ms::option", skip_serializing_if = "Option::is_none")]
    pub window_duration: Option<Duration>,
    #[serde(with = "duration_ms::option", skip_serializing_if = "Option::is_none")]
    pub rate_limit_wait: Option<Duration>,

    #[serde(with = "duration_ms::option", skip_serializing_if = "Option::is_none")]
    pub timeout_duration: Option<Duration>,
    pub cancel_running_future: Option<bool>,
}

impl CustomConfig {
    /// Overlay these overrides on `base` and validate the result.
    pub fn apply_to(&self, base: &PolicyConfig) -> Result<PolicyConfig, ConfigError> {
        let mut config = base.clone();

        let cb = &mut config.circuit_breaker;
        set(&mut cb.failure_rate_threshold, self.failure_rate_threshold);
        set(&mut cb.slow_call_rate_threshold, self.slow_call_rate_threshold);
        set(&mut cb.slow_call_duration_threshold, self.slow_call_duration_threshold);
        set(&mut cb.wait_duration_in_open_state, self.wait_duration_in_open_state);
        set(&mut cb.ring_buffer_size_in_closed_state, self.ring_buffer_size_in_closed_state);
        set(
            &mut cb.ring_buffer_size_in_half_open_state,
            self.ring_buffer_size_in_half_open_state,
        );

        let retry = &mut config.retry;
        set(&mut retry.max_attempts, self.max_attempts);
        set(&mut retry.base_wait_duration, self.base_wait_duration);
        set(&mut retry.backoff_multiplier, self.backoff_multiplier);

        let bulkhead = &mut config.bulkhead;
        set(&mut bulkhead.max_concurrent_calls, self.max_concurrent_calls);
        set(&mut bulkhead.max_wait_duration, self.max_wait_duration);
        set(&mut bulkhead.max_wait_queue, self.max_wait_queue);

        let rate = &mut config.rate_limiter;
        set(&mut rate.permits_per_window, self.permits_per_window);
        set(&mut rate.window_duration, self.window_duration);
        set(&mut rate.max_wait, self.rate_limit_wait);

        let time = &mut config.time_limiter;
        set(&mut time.timeout_duration, self.timeout_duration);
        set(&mut time.cancel_running_future, self.cancel_running_future);

        config.validate()?;
        Ok(config)
    }

    /// True when no option is overridden.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

/// Policy file: shared defaults plus named instance overrides.
///
/// ```yaml
/// defaults:
///   failureRateThreshold: 50
///   waitDurationInOpenState: 30s
/// instances:
///   inventory:
///     maxConcurrentCalls: 4
///     timeoutDuration: 250ms
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyFile {
    pub defaults: CustomConfig,
    pub instances: BTreeMap<String, CustomConfig>,
}

impl PolicyFile {
    /// Parse and validate a policy file from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let file: PolicyFile = serde_yaml::from_str(yaml)?;
        file.validate()?;
        Ok(file)
    }

    /// Load and validate a policy file from disk.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Built-in defaults with the file's `defaults` section applied.
    pub fn base_config(&self) -> Result<PolicyConfig, ConfigError> {
        self.defaults.apply_to(&PolicyConfig::default())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let base = self.base_config()?;
        for overrides in self.instances.values() {
            overrides.apply_to(&base)?;
        }
        Ok(())
    }
}

fn check_percentage(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 && value <= 100.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            field,
            format!("must be within (0, 100], got {value}"),
        ))
    }
}

fn check_positive_duration(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        Err(ConfigError::invalid(field, "must be greater than zero"))
    } else {
        Ok(())
    }
}

fn check_nonzero(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        Err(ConfigError::invalid(field, "must be at least 1"))
    } else {
        Ok(())
    }
}
