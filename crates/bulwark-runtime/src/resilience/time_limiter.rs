//! Time limiter.
//!
//! The guarded future runs on its own task. When the time budget runs out
//! the caller gets [`TimedOut`] immediately; the task is signalled through
//! its [`CancellationToken`] but is not aborted. If it ignores the signal it
//! runs to completion in the background and its result is discarded.
//!
//! This guarantees the caller's latency bound, not that the underlying work
//! stops.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use bulwark_core::{ComponentKind, EventOutcome, MetricEvent, MetricSink, TimeLimiterConfig};

/// The time budget ran out before the call completed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Timed out after {after:?}")]
pub struct TimedOut {
    pub after: Duration,
}

/// Time limiter for one dependency.
pub struct TimeLimiter {
    name: String,
    config: Arc<TimeLimiterConfig>,
    timeouts: AtomicU64,
    sink: Arc<dyn MetricSink>,
}

impl TimeLimiter {
    pub fn new(
        name: impl Into<String>,
        config: Arc<TimeLimiterConfig>,
        sink: Arc<dyn MetricSink>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            timeouts: AtomicU64::new(0),
            sink,
        }
    }

    pub fn config(&self) -> &Arc<TimeLimiterConfig> {
        &self.config
    }

    /// Run `future` with the configured time budget.
    ///
    /// `cancel` is the token the future observes; it is cancelled on timeout
    /// when `cancel_running_future` is set.
    pub async fn execute<T, Fut>(&self, cancel: CancellationToken, future: Fut) -> Result<T, TimedOut>
    where
        T: Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let budget = self.config.timeout_duration;
        let mut task = tokio::spawn(future);

        match tokio::time::timeout(budget, &mut task).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(join_error)) if join_error.is_panic() => {
                std::panic::resume_unwind(join_error.into_panic())
            }
            // Only reachable while the runtime shuts down; nothing to return.
            Ok(Err(_)) => Err(TimedOut { after: budget }),
            Err(_) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                if self.config.cancel_running_future {
                    cancel.cancel();
                }
                tracing::warn!(name = %self.name, timeout = ?budget, "Call timed out");
                self.emit(EventOutcome::Timeout {
                    after_ms: budget.as_millis() as u64,
                });
                self.discard_late_result(task);
                Err(TimedOut { after: budget })
            }
        }
    }

    fn discard_late_result<T: Send + 'static>(&self, task: tokio::task::JoinHandle<T>) {
        let name = self.name.clone();
        let sink = self.sink.clone();
        tokio::spawn(async move {
            if task.await.is_ok() {
                tracing::debug!(name = %name, "Discarding result of timed out call");
                sink.record(&MetricEvent::new(
                    name,
                    ComponentKind::TimeLimiter,
                    EventOutcome::ResultDiscarded,
                ));
            }
        });
    }

    /// Calls that exceeded the budget.
    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    fn emit(&self, outcome: EventOutcome) {
        self.sink
            .record(&MetricEvent::new(&self.name, ComponentKind::TimeLimiter, outcome));
    }
}
