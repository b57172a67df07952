//! # bulwark-core
//!
//! Runtime-agnostic building blocks for guarding calls to unreliable
//! dependencies.
//!
//! This crate holds the pieces that need no async runtime:
//! - Policy configuration with validation and YAML loading
//! - The circuit breaker state machine
//! - Metric events and sinks
//!
//! The async policies (retry, bulkhead, rate limiter, time limiter) and the
//! manager that composes them live in `bulwark-runtime`.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use bulwark_core::{CircuitBreaker, CircuitBreakerConfig, CircuitState, NoopSink};
//!
//! let config = CircuitBreakerConfig {
//!     ring_buffer_size_in_closed_state: 4,
//!     ..Default::default()
//! };
//! let breaker = CircuitBreaker::new("inventory", config, Arc::new(NoopSink));
//!
//! for _ in 0..4 {
//!     assert!(breaker.permit().is_allowed());
//!     breaker.on_failure(Duration::from_millis(12));
//! }
//! assert_eq!(breaker.state(), CircuitState::Open);
//! ```

pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod events;
pub mod types;

// Re-export main types at crate root
pub use circuit_breaker::{CallPermit, CircuitBreaker, CircuitBreakerMetrics};
pub use clock::{Clock, SystemClock};
pub use config::{
    BulkheadConfig, CircuitBreakerConfig, ConfigError, CustomConfig, PolicyConfig, PolicyFile,
    RateLimiterConfig, RetryConfig, TimeLimiterConfig, MAX_RETRY_WAIT,
};
pub use events::{EventOutcome, MemorySink, MetricEvent, MetricSink, NoopSink, TracingSink};
pub use types::{
    CircuitState, ComponentKind, FailureKind, HealthStatus, PermissionResult, PolicyFlags,
};
