//! Time source for the circuit breaker's open wait.

use std::time::Instant;

/// Source of the current instant.
///
/// An async runtime can plug in its own clock so that paused or simulated
/// time also drives circuit recovery.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The operating system's monotonic clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
