//! Retry with exponential backoff.
//!
//! Only the operation's own failures are retried. Policy rejections
//! (open circuit, full bulkhead, rate limit, timeout) are returned as-is,
//! since retrying them would defeat their purpose.

use backon::{ExponentialBuilder, Retryable};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bulwark_core::{ComponentKind, EventOutcome, MetricEvent, MetricSink, RetryConfig};

use crate::ResilienceError;

/// Call outcomes as seen by the retry layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryMetrics {
    pub successful_calls_without_retry: u64,
    pub successful_calls_with_retry: u64,
    pub failed_calls_without_retry: u64,
    pub failed_calls_with_retry: u64,
}

/// Retry policy for one dependency.
///
/// The configuration is shared between instances; attempt counting is
/// local to each [`execute`](Retry::execute) call.
pub struct Retry {
    name: String,
    config: Arc<RetryConfig>,
    success_without_retry: AtomicU64,
    success_with_retry: AtomicU64,
    failed_without_retry: AtomicU64,
    failed_with_retry: AtomicU64,
    sink: Arc<dyn MetricSink>,
}

impl Retry {
    pub fn new(name: impl Into<String>, config: Arc<RetryConfig>, sink: Arc<dyn MetricSink>) -> Self {
        Self {
            name: name.into(),
            config,
            success_without_retry: AtomicU64::new(0),
            success_with_retry: AtomicU64::new(0),
            failed_without_retry: AtomicU64::new(0),
            failed_with_retry: AtomicU64::new(0),
            sink,
        }
    }

    pub fn config(&self) -> &Arc<RetryConfig> {
        &self.config
    }

    fn backoff(&self) -> ExponentialBuilder {
        let config = &self.config;
        ExponentialBuilder::default()
            .with_min_delay(config.base_wait_duration)
            .with_factor(config.backoff_multiplier as f32)
            .with_max_delay(config.wait_after_attempt(config.max_attempts))
            .with_max_times(config.max_attempts.saturating_sub(1) as usize)
    }

    /// Run `operation` until it succeeds, returns a rejection, or
    /// `max_attempts` calls have failed. The last failure is returned.
    pub async fn execute<T, E, F, Fut>(&self, mut operation: F) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        let attempts = AtomicU32::new(0);

        let result = (|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            operation()
        })
        .retry(self.backoff())
        .sleep(tokio::time::sleep)
        .when(|err: &ResilienceError<E>| !err.is_rejection())
        .notify(|_err: &ResilienceError<E>, wait| {
            let attempt = attempts.load(Ordering::SeqCst);
            tracing::debug!(name = %self.name, attempt, wait = ?wait, "Retrying after failure");
            self.emit(EventOutcome::RetryScheduled {
                attempt,
                wait_ms: wait.as_millis() as u64,
            });
        })
        .await;

        let attempts = attempts.into_inner();
        match &result {
            Ok(_) if attempts > 1 => {
                self.success_with_retry.fetch_add(1, Ordering::Relaxed);
                self.emit(EventOutcome::SuccessAfterRetry { attempts });
            }
            Ok(_) => {
                self.success_without_retry.fetch_add(1, Ordering::Relaxed);
                self.emit(EventOutcome::SuccessWithoutRetry);
            }
            Err(err) if err.is_rejection() => {}
            Err(_) if attempts > 1 => {
                self.failed_with_retry.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(name = %self.name, attempts, "Retries exhausted");
                self.emit(EventOutcome::RetryExhausted { attempts });
            }
            Err(_) => {
                self.failed_without_retry.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    pub fn metrics(&self) -> RetryMetrics {
        RetryMetrics {
            successful_calls_without_retry: self.success_without_retry.load(Ordering::Relaxed),
            successful_calls_with_retry: self.success_with_retry.load(Ordering::Relaxed),
            failed_calls_without_retry: self.failed_without_retry.load(Ordering::Relaxed),
            failed_calls_with_retry: self.failed_with_retry.load(Ordering::Relaxed),
        }
    }

    fn emit(&self, outcome: EventOutcome) {
        self.sink
            .record(&MetricEvent::new(&self.name, ComponentKind::Retry, outcome));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_core::{MemorySink, MAX_RETRY_WAIT};
    use std::time::Duration;
    use tokio::time::Instant;

    fn retry(max_attempts: u32, sink: Arc<MemorySink>) -> Retry {
        let config = RetryConfig {
            max_attempts,
            base_wait_duration: Duration::from_millis(100),
            backoff_multiplier: 2.0,
        };
        Retry::new("test", Arc::new(config), sink)
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_operation_called_max_attempts() {
        let sink = Arc::new(MemorySink::new());
        let retry = retry(3, sink.clone());
        let calls = AtomicU32::new(0);

        let result: Result<(), ResilienceError<&str>> = retry
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ResilienceError::Operation("down"))
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::Operation("down"))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retry.metrics().failed_calls_with_retry, 1);
        assert_eq!(sink.count("retry.exhausted"), 1);
        assert_eq!(sink.count("retry.scheduled"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_between_attempts() {
        let retry = retry(3, Arc::new(MemorySink::new()));
        let started = Instant::now();

        let _: Result<(), ResilienceError<&str>> = retry
            .execute(|| async { Err(ResilienceError::Operation("down")) })
            .await;

        // 100ms after the first failure, 200ms after the second
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(320));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_retry_is_tagged() {
        let sink = Arc::new(MemorySink::new());
        let retry = retry(3, sink.clone());
        let calls = AtomicU32::new(0);

        let result: Result<u32, ResilienceError<&str>> = retry
            .execute(|| async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ResilienceError::Operation("blip"))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        let metrics = retry.metrics();
        assert_eq!(metrics.successful_calls_with_retry, 1);
        assert_eq!(metrics.successful_calls_without_retry, 0);
        assert_eq!(sink.count("retry.success_after_retry"), 1);
    }

    #[tokio::test]
    async fn test_first_attempt_success() {
        let sink = Arc::new(MemorySink::new());
        let retry = retry(3, sink.clone());

        let result: Result<u32, ResilienceError<&str>> = retry.execute(|| async { Ok(1) }).await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(retry.metrics().successful_calls_without_retry, 1);
        assert_eq!(sink.count("retry.success_without_retry"), 1);
    }

    #[tokio::test]
    async fn test_large_attempt_budget_runs_first_attempt() {
        let retry = retry(100, Arc::new(MemorySink::new()));

        let result: Result<u32, ResilienceError<&str>> = retry.execute(|| async { Ok(1) }).await;

        assert_eq!(result.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_backoff_is_capped() {
        let retry = retry(100, Arc::new(MemorySink::new()));
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let _: Result<(), ResilienceError<&str>> = retry
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ResilienceError::Operation("down"))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 100);
        assert!(started.elapsed() <= MAX_RETRY_WAIT * 99);
    }

    #[tokio::test]
    async fn test_rejections_are_not_retried() {
        let retry = retry(5, Arc::new(MemorySink::new()));
        let calls = AtomicU32::new(0);

        let result: Result<(), ResilienceError<&str>> = retry
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ResilienceError::CircuitOpen {
                    name: "test".to_string(),
                })
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(retry.metrics(), RetryMetrics::default());
    }

    #[tokio::test]
    async fn test_single_attempt_config_never_retries() {
        let retry = retry(1, Arc::new(MemorySink::new()));
        let calls = AtomicU32::new(0);

        let _: Result<(), ResilienceError<&str>> = retry
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ResilienceError::Operation("down"))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(retry.metrics().failed_calls_without_retry, 1);
    }
}
