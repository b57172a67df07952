//! Bulkhead bounding concurrent calls per dependency.
//!
//! A call holds a [`BulkheadPermit`] for as long as it runs. Dropping the
//! permit frees the slot, so every exit path releases exactly once.
//! Callers that find no free slot queue in FIFO order for at most
//! `max_wait_duration`; at most `max_wait_queue` callers may queue at once.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use bulwark_core::{BulkheadConfig, ComponentKind, EventOutcome, MetricEvent, MetricSink};

/// Slot held by an admitted call.
#[derive(Debug)]
pub struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
}

/// Point-in-time view of a bulkhead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkheadMetrics {
    pub max_concurrent_calls: usize,
    pub active_calls: usize,
    pub available_slots: usize,
    pub queued_calls: usize,
    pub rejected_calls: u64,
}

/// Concurrency limiter for one dependency.
pub struct Bulkhead {
    name: String,
    config: BulkheadConfig,
    slots: Arc<Semaphore>,
    queued: AtomicUsize,
    rejected: AtomicU64,
    sink: Arc<dyn MetricSink>,
}

/// Counts a caller as queued until dropped.
struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Bulkhead {
    pub fn new(name: impl Into<String>, config: BulkheadConfig, sink: Arc<dyn MetricSink>) -> Self {
        Self {
            name: name.into(),
            slots: Arc::new(Semaphore::new(config.max_concurrent_calls)),
            config,
            queued: AtomicUsize::new(0),
            rejected: AtomicU64::new(0),
            sink,
        }
    }

    /// Take a slot if one is free right now.
    pub fn try_acquire(&self) -> Option<BulkheadPermit> {
        match self.slots.clone().try_acquire_owned() {
            Ok(permit) => Some(self.admitted(permit)),
            Err(_) => {
                self.reject();
                None
            }
        }
    }

    /// Take a slot, queueing for up to `max_wait_duration`.
    ///
    /// Returns `None` when the queue is full or the wait expires.
    pub async fn acquire(&self) -> Option<BulkheadPermit> {
        if let Ok(permit) = self.slots.clone().try_acquire_owned() {
            return Some(self.admitted(permit));
        }
        if self.config.max_wait_duration.is_zero() {
            self.reject();
            return None;
        }

        if self.queued.fetch_add(1, Ordering::SeqCst) >= self.config.max_wait_queue {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            self.reject();
            return None;
        }
        let _slot = QueueSlot(&self.queued);

        let waited = tokio::time::timeout(
            self.config.max_wait_duration,
            self.slots.clone().acquire_owned(),
        )
        .await;

        match waited {
            Ok(Ok(permit)) => Some(self.admitted(permit)),
            // Timed out, or the semaphore was closed
            _ => {
                self.reject();
                None
            }
        }
    }

    fn admitted(&self, permit: OwnedSemaphorePermit) -> BulkheadPermit {
        self.emit(EventOutcome::BulkheadAcquired);
        BulkheadPermit { _permit: permit }
    }

    fn reject(&self) {
        self.rejected.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            name = %self.name,
            max_concurrent_calls = self.config.max_concurrent_calls,
            "Bulkhead full, call rejected"
        );
        self.emit(EventOutcome::BulkheadFull);
    }

    /// Calls currently holding a slot.
    pub fn active(&self) -> usize {
        self.config.max_concurrent_calls - self.slots.available_permits()
    }

    /// Free slots.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn metrics(&self) -> BulkheadMetrics {
        BulkheadMetrics {
            max_concurrent_calls: self.config.max_concurrent_calls,
            active_calls: self.active(),
            available_slots: self.available(),
            queued_calls: self.queued.load(Ordering::SeqCst),
            rejected_calls: self.rejected.load(Ordering::SeqCst),
        }
    }

    fn emit(&self, outcome: EventOutcome) {
        self.sink
            .record(&MetricEvent::new(&self.name, ComponentKind::Bulkhead, outcome));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_core::NoopSink;
    use std::time::Duration;

    fn bulkhead(max: usize, wait_ms: u64, queue: usize) -> Bulkhead {
        let config = BulkheadConfig {
            max_concurrent_calls: max,
            max_wait_duration: Duration::from_millis(wait_ms),
            max_wait_queue: queue,
        };
        Bulkhead::new("test", config, Arc::new(NoopSink))
    }

    #[test]
    fn test_try_acquire_respects_limit() {
        let bh = bulkhead(2, 0, 0);

        let a = bh.try_acquire();
        let b = bh.try_acquire();
        assert!(a.is_some() && b.is_some());
        assert!(bh.try_acquire().is_none());
        assert_eq!(bh.active(), 2);

        drop(a);
        assert_eq!(bh.active(), 1);
        assert!(bh.try_acquire().is_some());
        assert_eq!(bh.metrics().rejected_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_when_full() {
        let bh = bulkhead(1, 100, 10);
        let _held = bh.acquire().await.unwrap();

        let started = tokio::time::Instant::now();
        assert!(bh.acquire().await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(bh.metrics().queued_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_admitted_when_slot_frees() {
        let bh = Arc::new(bulkhead(1, 500, 10));
        let held = bh.acquire().await.unwrap();

        let waiter = {
            let bh = bh.clone();
            tokio::spawn(async move { bh.acquire().await.is_some() })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);

        assert!(waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_bound_rejects_immediately() {
        let bh = Arc::new(bulkhead(1, 1_000, 1));
        let _held = bh.acquire().await.unwrap();

        let queued = {
            let bh = bh.clone();
            tokio::spawn(async move { bh.acquire().await.is_some() })
        };
        tokio::task::yield_now().await;
        assert_eq!(bh.metrics().queued_calls, 1);

        let started = tokio::time::Instant::now();
        assert!(bh.acquire().await.is_none());
        assert_eq!(started.elapsed(), Duration::ZERO);

        assert!(!queued.await.unwrap());
    }

    #[tokio::test]
    async fn test_permit_released_on_panic_path() {
        let bh = Arc::new(bulkhead(1, 0, 0));
        let task = {
            let bh = bh.clone();
            tokio::spawn(async move {
                let _permit = bh.acquire().await.unwrap();
                panic!("operation blew up");
            })
        };
        assert!(task.await.is_err());
        assert_eq!(bh.active(), 0);
    }
}
