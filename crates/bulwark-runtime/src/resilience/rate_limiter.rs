//! Fixed-window rate limiter.
//!
//! Each window admits `permits_per_window` calls. The counter is refilled
//! in one step when a window boundary passes; boundaries stay aligned to
//! the limiter's creation time. In blocking mode callers line up on a fair
//! mutex, so they are admitted in arrival order once the next window opens.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use bulwark_core::{ComponentKind, EventOutcome, MetricEvent, MetricSink, RateLimiterConfig};

#[derive(Debug)]
struct WindowState {
    available: u32,
    refill_at: Instant,
}

/// Point-in-time view of a rate limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimiterMetrics {
    pub permits_per_window: u32,
    pub available_permits: u32,
    pub rejected_calls: u64,
}

/// Rate limiter for one dependency.
pub struct RateLimiter {
    name: String,
    config: RateLimiterConfig,
    state: Mutex<WindowState>,
    line: tokio::sync::Mutex<()>,
    rejected: AtomicU64,
    sink: Arc<dyn MetricSink>,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, config: RateLimiterConfig, sink: Arc<dyn MetricSink>) -> Self {
        let state = WindowState {
            available: config.permits_per_window,
            refill_at: Instant::now() + config.window_duration,
        };
        Self {
            name: name.into(),
            config,
            state: Mutex::new(state),
            line: tokio::sync::Mutex::new(()),
            rejected: AtomicU64::new(0),
            sink,
        }
    }

    /// Take a permit from the current window, or report how long until the next one.
    fn take(&self) -> Result<(), Duration> {
        let mut state = self.state.lock();
        let now = Instant::now();
        self.refill(&mut state, now);

        if state.available > 0 {
            state.available -= 1;
            Ok(())
        } else {
            Err(state.refill_at - now)
        }
    }

    fn refill(&self, state: &mut WindowState, now: Instant) {
        if now < state.refill_at {
            return;
        }
        let window = self.config.window_duration;
        let overshoot = (now - state.refill_at).as_nanos() % window.as_nanos();
        state.refill_at = now - Duration::from_nanos(overshoot as u64) + window;
        state.available = self.config.permits_per_window;
    }

    /// Take a permit without waiting.
    pub fn try_acquire(&self) -> bool {
        match self.take() {
            Ok(()) => self.acquired(),
            Err(_) => self.reject(),
        }
    }

    /// Take a permit, waiting up to `max_wait` for the next window.
    ///
    /// Fails immediately when the limiter is non-blocking or the next window
    /// opens after the wait budget.
    pub async fn acquire(&self) -> bool {
        if self.config.is_non_blocking() {
            return self.try_acquire();
        }

        let deadline = Instant::now() + self.config.max_wait;
        let Ok(_turn) = tokio::time::timeout_at(deadline, self.line.lock()).await else {
            return self.reject();
        };

        loop {
            match self.take() {
                Ok(()) => return self.acquired(),
                Err(wait) if Instant::now() + wait > deadline => return self.reject(),
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
    }

    fn acquired(&self) -> bool {
        self.emit(EventOutcome::PermitAcquired);
        true
    }

    fn reject(&self) -> bool {
        self.rejected.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            name = %self.name,
            permits_per_window = self.config.permits_per_window,
            "Rate limit exceeded"
        );
        self.emit(EventOutcome::RateLimited);
        false
    }

    /// Permits left in the current window.
    pub fn available_permits(&self) -> u32 {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        state.available
    }

    pub fn metrics(&self) -> RateLimiterMetrics {
        RateLimiterMetrics {
            permits_per_window: self.config.permits_per_window,
            available_permits: self.available_permits(),
            rejected_calls: self.rejected.load(Ordering::SeqCst),
        }
    }

    fn emit(&self, outcome: EventOutcome) {
        self.sink
            .record(&MetricEvent::new(&self.name, ComponentKind::RateLimiter, outcome));
    }
}
