use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{ConfigError, default_true};

/// Resilience settings applied to every call to the identity provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResilienceConfig {
    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

impl ResilienceConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        self.retry.validate()?;
        self.circuit_breaker.validate()
    }
}

/// Configuration for IdP request retries.
///
/// Delays grow geometrically from `initial_delay_ms` by `backoff_multiplier`
/// and are capped at `max_delay_ms`. The multiplier must be at least 1.0 so
/// the delay between attempts never shrinks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Whether retries are enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum number of retry attempts (not including the initial request).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry in milliseconds.
    #[serde(default = "default_initial_delay_ms", alias = "retry_backoff")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff. 1.0 gives a fixed delay.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryConfig {
    /// Calculate the delay for a given retry attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay = (self.initial_delay_ms as f64)
            * self
                .backoff_multiplier
                .max(1.0)
                .powi(attempt.min(i32::MAX as u32) as i32);
        let capped_delay = base_delay.min(self.max_delay_ms.max(self.initial_delay_ms) as f64);

        Duration::from_millis(capped_delay.max(0.0) as u64)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::Validation(
                "resilience.retry.backoff_multiplier must be a finite value >= 1.0".into(),
            ));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(ConfigError::Validation(
                "resilience.retry.max_delay_ms must not be smaller than initial_delay_ms".into(),
            ));
        }
        Ok(())
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

/// Circuit breaker guarding the IdP metadata endpoint.
///
/// Outcomes are tracked in a count-based rolling window of the most recent
/// `sliding_window_size` calls. Once at least `minimum_calls` outcomes are in
/// the window and the failure rate reaches `failure_rate_threshold` percent,
/// the circuit opens for `wait_duration_ms`. After the wait a single trial
/// call is let through; its outcome closes or reopens the circuit.
///
/// Repeated opens without recovery can lengthen the wait:
/// `min(wait * wait_backoff_multiplier^consecutive_opens, max_wait_duration_ms)`.
/// The default multiplier of 1.0 keeps the wait fixed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    /// Whether the circuit breaker is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Failure rate in percent (0-100] at which the circuit opens.
    #[serde(default = "default_failure_rate_threshold", alias = "failure_threshold")]
    pub failure_rate_threshold: f64,

    /// Number of most recent call outcomes considered.
    #[serde(default = "default_sliding_window_size")]
    pub sliding_window_size: u32,

    /// Outcomes required in the window before the rate is evaluated.
    #[serde(default = "default_minimum_calls")]
    pub minimum_calls: u32,

    /// How long the circuit stays open before a trial call, in milliseconds.
    #[serde(default = "default_wait_duration_ms", alias = "wait_duration")]
    pub wait_duration_ms: u64,

    /// Multiplier applied to the wait after each failed trial.
    #[serde(default = "default_wait_backoff_multiplier")]
    pub wait_backoff_multiplier: f64,

    /// Cap for the adaptive wait in milliseconds.
    #[serde(default = "default_max_wait_duration_ms")]
    pub max_wait_duration_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_rate_threshold: default_failure_rate_threshold(),
            sliding_window_size: default_sliding_window_size(),
            minimum_calls: default_minimum_calls(),
            wait_duration_ms: default_wait_duration_ms(),
            wait_backoff_multiplier: default_wait_backoff_multiplier(),
            max_wait_duration_ms: default_max_wait_duration_ms(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Calculate the open duration for a given number of consecutive opens.
    pub fn calculate_wait_millis(&self, consecutive_opens: u32) -> u64 {
        if consecutive_opens == 0 || self.wait_backoff_multiplier <= 1.0 {
            return self.wait_duration_ms;
        }

        let multiplied = (self.wait_duration_ms as f64)
            * self
                .wait_backoff_multiplier
                .powi(consecutive_opens.min(i32::MAX as u32) as i32);

        (multiplied as u64)
            .min(self.max_wait_duration_ms)
            .max(self.wait_duration_ms)
    }

    /// Minimum number of recorded outcomes before the rate is evaluated.
    pub fn effective_minimum_calls(&self) -> usize {
        self.minimum_calls.clamp(1, self.sliding_window_size.max(1)) as usize
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.failure_rate_threshold > 0.0 && self.failure_rate_threshold <= 100.0) {
            return Err(ConfigError::Validation(
                "resilience.circuit_breaker.failure_rate_threshold must be in (0, 100]".into(),
            ));
        }
        if self.sliding_window_size == 0 {
            return Err(ConfigError::Validation(
                "resilience.circuit_breaker.sliding_window_size must be greater than 0".into(),
            ));
        }
        if self.minimum_calls > self.sliding_window_size {
            return Err(ConfigError::Validation(
                "resilience.circuit_breaker.minimum_calls must not exceed sliding_window_size"
                    .into(),
            ));
        }
        if !self.wait_backoff_multiplier.is_finite() || self.wait_backoff_multiplier < 1.0 {
            return Err(ConfigError::Validation(
                "resilience.circuit_breaker.wait_backoff_multiplier must be a finite value >= 1.0"
                    .into(),
            ));
        }
        Ok(())
    }
}

fn default_failure_rate_threshold() -> f64 {
    50.0
}

fn default_sliding_window_size() -> u32 {
    10
}

fn default_minimum_calls() -> u32 {
    5
}

fn default_wait_duration_ms() -> u64 {
    30_000
}

fn default_wait_backoff_multiplier() -> f64 {
    1.0
}

fn default_max_wait_duration_ms() -> u64 {
    300_000
}
