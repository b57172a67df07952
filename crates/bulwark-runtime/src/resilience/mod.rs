//! Async policies for bulwark-runtime.
//!
//! This module provides:
//! - Bulkhead to bound concurrent calls
//! - Fixed-window rate limiter
//! - Retry with exponential backoff
//! - Time limiter with cooperative cancellation
//!
//! The circuit breaker is synchronous and lives in `bulwark-core`.

mod bulkhead;
mod rate_limiter;
mod retry;
mod time_limiter;

pub use bulkhead::{Bulkhead, BulkheadMetrics, BulkheadPermit};
pub use rate_limiter::{RateLimiter, RateLimiterMetrics};
pub use retry::{Retry, RetryMetrics};
pub use time_limiter::{TimeLimiter, TimedOut};
