//! Retry with exponential backoff, optionally behind a circuit breaker.
//!
//! A call sequence is: check the breaker, run the operation up to
//! `max_retries + 1` times, then record one outcome on the breaker. The
//! breaker therefore sees one result per logical call, not per attempt.

use std::future::Future;

use tracing::{debug, warn};

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use crate::config::RetryConfig;

/// Error returned by [`with_circuit_breaker_and_retry`].
#[derive(Debug, thiserror::Error)]
pub enum ResilientCallError<E> {
    #[error(transparent)]
    CircuitOpen(#[from] CircuitBreakerError),

    #[error(transparent)]
    Operation(E),
}

/// Execute an async operation with retry logic.
///
/// `is_retryable` decides whether an error is worth another attempt. Returns
/// the first success, or the last error once attempts are exhausted.
///
/// # Example
///
/// ```ignore
/// let metadata = with_retry(
///     &retry_config,
///     "fetch_idp_metadata",
///     |e: &MetadataError| e.is_transient(),
///     || async { client.get(url).send().await },
/// ).await?;
/// ```
pub async fn with_retry<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    is_retryable: P,
    operation: F,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    if !config.enabled {
        return operation().await;
    }

    let max_attempts = config.max_retries.saturating_add(1);
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(error) => {
                if is_retryable(&error) && attempt + 1 < max_attempts {
                    let delay = config.delay_for_attempt(attempt);
                    warn!(
                        operation = operation_name,
                        error = %error,
                        attempt = attempt + 1,
                        max_attempts,
                        delay_ms = delay.as_millis(),
                        "Retryable error, will retry after delay"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }

                if attempt > 0 {
                    warn!(
                        operation = operation_name,
                        error = %error,
                        attempts = attempt + 1,
                        "Operation failed after all retry attempts"
                    );
                }
                return Err(error);
            }
        }
    }
}

/// Execute an async operation with circuit breaker and retry logic.
///
/// 1. If the breaker rejects the call, return [`ResilientCallError::CircuitOpen`]
///    without running the operation.
/// 2. Otherwise run [`with_retry`].
/// 3. Record the final outcome on the breaker.
pub async fn with_circuit_breaker_and_retry<F, Fut, T, E, P>(
    circuit_breaker: Option<&CircuitBreaker>,
    retry_config: &RetryConfig,
    service_name: &str,
    operation_name: &str,
    is_retryable: P,
    operation: F,
) -> Result<T, ResilientCallError<E>>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    if let Some(cb) = circuit_breaker {
        cb.check()?;
    }

    let result = with_retry(retry_config, operation_name, is_retryable, operation).await;

    if let Some(cb) = circuit_breaker {
        match &result {
            Ok(_) => cb.record_success(),
            Err(_) => {
                debug!(
                    service = service_name,
                    operation = operation_name,
                    "Recording failure to circuit breaker"
                );
                cb.record_failure();
            }
        }
    }

    result.map_err(ResilientCallError::Operation)
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use chrono::Utc;

    use super::*;
    use crate::{
        clock::ManualClock,
        config::CircuitBreakerConfig,
        resilience::CircuitState,
    };

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            enabled: true,
            max_retries,
            initial_delay_ms: 5,
            max_delay_ms: 20,
            backoff_multiplier: 2.0,
        }
    }

    fn breaker() -> CircuitBreaker {
        let config = CircuitBreakerConfig {
            minimum_calls: 2,
            sliding_window_size: 4,
            ..Default::default()
        };
        CircuitBreaker::new("idp", &config, Arc::new(ManualClock::new(Utc::now())))
    }

    #[tokio::test]
    async fn test_retry_succeeds_first_attempt() {
        let attempt_count = AtomicU32::new(0);

        let result: Result<i32, String> = with_retry(
            &fast_retry(3),
            "test_op",
            |_| true,
            || {
                attempt_count.fetch_add(1, Ordering::SeqCst);
                async { Ok(42) }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_retry() {
        let attempt_count = AtomicU32::new(0);

        let result: Result<i32, String> = with_retry(
            &fast_retry(3),
            "test_op",
            |_| true,
            || {
                let count = attempt_count.fetch_add(1, Ordering::SeqCst);
                async move {
                    if count < 2 {
                        Err("connection reset".to_string())
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_retries() {
        let attempt_count = AtomicU32::new(0);

        let result: Result<i32, String> = with_retry(
            &fast_retry(2),
            "test_op",
            |_| true,
            || {
                let count = attempt_count.fetch_add(1, Ordering::SeqCst);
                async move { Err(format!("timeout #{count}")) }
            },
        )
        .await;

        // max_retries=2 means 3 total attempts, last error wins
        assert_eq!(result.unwrap_err(), "timeout #2");
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_non_retryable_error() {
        let attempt_count = AtomicU32::new(0);

        let result: Result<i32, String> = with_retry(
            &fast_retry(3),
            "test_op",
            |e: &String| !e.contains("permanent"),
            || {
                attempt_count.fetch_add(1, Ordering::SeqCst);
                async { Err("permanent failure".to_string()) }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_disabled() {
        let config = RetryConfig {
            enabled: false,
            ..fast_retry(3)
        };
        let attempt_count = AtomicU32::new(0);

        let result: Result<i32, String> = with_retry(
            &config,
            "test_op",
            |_| true,
            || {
                attempt_count.fetch_add(1, Ordering::SeqCst);
                async { Err("error".to_string()) }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sequence_records_one_outcome() {
        let cb = breaker();
        let attempt_count = AtomicU32::new(0);

        let result: Result<(), ResilientCallError<String>> = with_circuit_breaker_and_retry(
            Some(&cb),
            &fast_retry(3),
            "idp",
            "fetch_metadata",
            |_| true,
            || {
                attempt_count.fetch_add(1, Ordering::SeqCst);
                async { Err("unreachable".to_string()) }
            },
        )
        .await;

        assert!(matches!(result, Err(ResilientCallError::Operation(_))));
        assert_eq!(attempt_count.load(Ordering::SeqCst), 4);
        assert_eq!(cb.failure_count(), 1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_open_breaker_skips_operation() {
        let cb = breaker();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        let attempt_count = AtomicU32::new(0);
        let result: Result<i32, ResilientCallError<String>> = with_circuit_breaker_and_retry(
            Some(&cb),
            &fast_retry(3),
            "idp",
            "fetch_metadata",
            |_| true,
            || {
                attempt_count.fetch_add(1, Ordering::SeqCst);
                async { Ok(1) }
            },
        )
        .await;

        assert!(matches!(result, Err(ResilientCallError::CircuitOpen(_))));
        assert_eq!(attempt_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_without_breaker_passes_through() {
        let result: Result<i32, ResilientCallError<String>> = with_circuit_breaker_and_retry(
            None,
            &fast_retry(0),
            "idp",
            "fetch_metadata",
            |_| true,
            || async { Ok(7) },
        )
        .await;

        assert_eq!(result.unwrap(), 7);
    }
}
