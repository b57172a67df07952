//! # bulwark-runtime
//!
//! Guards calls to unreliable dependencies by wrapping them in five
//! policies, outermost first:
//!
//! ```text
//! TimeLimiter → Bulkhead → RateLimiter → Retry → CircuitBreaker → operation
//! ```
//!
//! Each dependency name gets its own set of policies, created on first use
//! by the [`PolicyRegistry`] and shared by every concurrent call for that
//! name. The [`ResilienceManager`] is the façade callers use.
//!
//! ## Example
//!
//! ```rust,ignore
//! use bulwark_runtime::ResilienceManager;
//!
//! let manager = ResilienceManager::with_defaults();
//!
//! let stock = manager
//!     .execute("inventory", || async { client.stock_level("sku-42").await })
//!     .await?;
//!
//! let price = manager
//!     .execute_with_fallback(
//!         "pricing",
//!         || async { client.price("sku-42").await },
//!         |_err| cached_price,
//!     )
//!     .await;
//! ```

use std::time::Duration;
use thiserror::Error;

use bulwark_core::FailureKind;

pub mod manager;
pub mod metrics;
pub mod registry;
pub mod resilience;

pub use manager::ResilienceManager;
pub use metrics::{CallMetrics, InstanceMetrics};
pub use registry::{PolicyInstance, PolicyRegistry, TokioClock};
pub use resilience::{
    Bulkhead, BulkheadMetrics, BulkheadPermit, RateLimiter, RateLimiterMetrics, Retry,
    RetryMetrics, TimeLimiter, TimedOut,
};

pub use bulwark_core::{
    CircuitState, ConfigError, CustomConfig, HealthStatus, MetricEvent, MetricSink, PolicyConfig,
    PolicyFile, PolicyFlags,
};
pub use tokio_util::sync::CancellationToken;

/// Why a guarded call did not produce a value.
///
/// `E` is the error type of the wrapped operation.
#[derive(Error, Debug)]
pub enum ResilienceError<E> {
    #[error("Operation failed: {0}")]
    Operation(E),

    #[error("Circuit breaker '{name}' is open")]
    CircuitOpen { name: String },

    #[error("Bulkhead '{name}' is full")]
    BulkheadFull { name: String },

    #[error("Rate limit exceeded for '{name}'")]
    RateLimited { name: String },

    #[error("Call to '{name}' timed out after {after:?}")]
    Timeout { name: String, after: Duration },
}

impl<E> ResilienceError<E> {
    pub fn kind(&self) -> FailureKind {
        match self {
            ResilienceError::Operation(_) => FailureKind::OperationFailure,
            ResilienceError::CircuitOpen { .. } => FailureKind::CircuitOpen,
            ResilienceError::BulkheadFull { .. } => FailureKind::BulkheadFull,
            ResilienceError::RateLimited { .. } => FailureKind::RateLimited,
            ResilienceError::Timeout { .. } => FailureKind::Timeout,
        }
    }

    /// True for policy rejections, false for the operation's own failures.
    pub fn is_rejection(&self) -> bool {
        self.kind().is_rejection()
    }

    /// The operation's error, if that is what failed.
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            ResilienceError::Operation(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let op: ResilienceError<&str> = ResilienceError::Operation("boom");
        assert_eq!(op.kind(), FailureKind::OperationFailure);
        assert!(!op.is_rejection());
        assert_eq!(op.into_operation_error(), Some("boom"));

        let open: ResilienceError<&str> = ResilienceError::CircuitOpen {
            name: "db".to_string(),
        };
        assert!(open.is_rejection());
        assert_eq!(open.to_string(), "Circuit breaker 'db' is open");
        assert_eq!(open.into_operation_error(), None);
    }

    #[test]
    fn test_timeout_message() {
        let err: ResilienceError<String> = ResilienceError::Timeout {
            name: "search".to_string(),
            after: Duration::from_millis(250),
        };
        assert_eq!(err.kind(), FailureKind::Timeout);
        assert_eq!(err.to_string(), "Call to 'search' timed out after 250ms");
    }
}
