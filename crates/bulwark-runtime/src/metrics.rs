//! Per-instance counters and metric snapshots.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use bulwark_core::{CircuitBreakerMetrics, CircuitState, FailureKind, HealthStatus};

use crate::resilience::{BulkheadMetrics, RateLimiterMetrics, RetryMetrics};
use crate::ResilienceError;

/// Final outcomes of calls made through the manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CallMetrics {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub circuit_open_calls: u64,
    pub bulkhead_full_calls: u64,
    pub rate_limited_calls: u64,
    pub timed_out_calls: u64,
    pub fallbacks_applied: u64,
}

/// Atomic counters behind [`CallMetrics`].
#[derive(Debug, Default)]
pub(crate) struct CallCounters {
    successful: AtomicU64,
    failed: AtomicU64,
    circuit_open: AtomicU64,
    bulkhead_full: AtomicU64,
    rate_limited: AtomicU64,
    timed_out: AtomicU64,
    fallbacks: AtomicU64,
}

impl CallCounters {
    pub(crate) fn record<T, E>(&self, result: &Result<T, ResilienceError<E>>) {
        match result {
            Ok(_) => self.record_success(),
            Err(err) => self.record_failure(err.kind()),
        }
    }

    pub(crate) fn record_success(&self) {
        self.successful.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self, kind: FailureKind) {
        let counter = match kind {
            FailureKind::OperationFailure => &self.failed,
            FailureKind::CircuitOpen => &self.circuit_open,
            FailureKind::BulkheadFull => &self.bulkhead_full,
            FailureKind::RateLimited => &self.rate_limited,
            FailureKind::Timeout => &self.timed_out,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CallMetrics {
        let successful_calls = self.successful.load(Ordering::Relaxed);
        let failed_calls = self.failed.load(Ordering::Relaxed);
        let circuit_open_calls = self.circuit_open.load(Ordering::Relaxed);
        let bulkhead_full_calls = self.bulkhead_full.load(Ordering::Relaxed);
        let rate_limited_calls = self.rate_limited.load(Ordering::Relaxed);
        let timed_out_calls = self.timed_out.load(Ordering::Relaxed);

        CallMetrics {
            total_calls: successful_calls
                + failed_calls
                + circuit_open_calls
                + bulkhead_full_calls
                + rate_limited_calls
                + timed_out_calls,
            successful_calls,
            failed_calls,
            circuit_open_calls,
            bulkhead_full_calls,
            rate_limited_calls,
            timed_out_calls,
            fallbacks_applied: self.fallbacks.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of every policy guarding one dependency.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceMetrics {
    pub name: String,
    pub state: CircuitState,
    pub health: HealthStatus,
    pub circuit_breaker: CircuitBreakerMetrics,
    pub bulkhead: BulkheadMetrics,
    pub rate_limiter: RateLimiterMetrics,
    pub retry: RetryMetrics,
    pub calls: CallMetrics,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_snapshot_totals() {
        let counters = CallCounters::default();
        counters.record::<_, &str>(&Ok(()));
        counters.record_success();
        counters.record::<(), _>(&Err(ResilienceError::Operation("boom")));
        counters.record_failure(FailureKind::Timeout);
        counters.record_fallback();

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.total_calls, 4);
        assert_eq!(snapshot.successful_calls, 2);
        assert_eq!(snapshot.timed_out_calls, 1);
        assert_eq!(snapshot.fallbacks_applied, 1);
    }
}
