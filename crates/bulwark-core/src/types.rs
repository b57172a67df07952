//! Shared value types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation, outcomes fill the sliding window
    Closed,

    /// Calls are rejected until the open wait elapses
    Open,

    /// A limited batch of trial calls decides the next state
    HalfOpen,

    /// Held open by an operator until released
    ForcedOpen,

    /// Held closed by an operator until released
    ForcedClosed,
}

impl CircuitState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
            CircuitState::ForcedOpen => 3,
            CircuitState::ForcedClosed => 4,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            3 => CircuitState::ForcedOpen,
            4 => CircuitState::ForcedClosed,
            _ => CircuitState::Closed,
        }
    }

    /// Whether calls are being short-circuited.
    pub fn is_open(self) -> bool {
        matches!(self, CircuitState::Open | CircuitState::ForcedOpen)
    }

    /// Health signal derived from the state.
    pub fn health(self) -> HealthStatus {
        if self.is_open() {
            HealthStatus::Down
        } else {
            HealthStatus::Up
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
            CircuitState::ForcedOpen => "FORCED_OPEN",
            CircuitState::ForcedClosed => "FORCED_CLOSED",
        };
        f.write_str(name)
    }
}

/// Answer to a circuit breaker permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionResult {
    Allowed,
    Rejected,
}

impl PermissionResult {
    pub fn is_allowed(self) -> bool {
        matches!(self, PermissionResult::Allowed)
    }
}

/// Binary health signal for a dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Up,
    Down,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Up => "UP",
            HealthStatus::Down => "DOWN",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which policy produced a metric event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    CircuitBreaker,
    Retry,
    Bulkhead,
    RateLimiter,
    TimeLimiter,
    Manager,
}

impl ComponentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ComponentKind::CircuitBreaker => "circuit_breaker",
            ComponentKind::Retry => "retry",
            ComponentKind::Bulkhead => "bulkhead",
            ComponentKind::RateLimiter => "rate_limiter",
            ComponentKind::TimeLimiter => "time_limiter",
            ComponentKind::Manager => "manager",
        }
    }
}

/// Failure taxonomy for a guarded call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// The wrapped operation itself failed
    OperationFailure,
    CircuitOpen,
    BulkheadFull,
    RateLimited,
    Timeout,
}

impl FailureKind {
    /// Policy rejections are never retried.
    pub fn is_rejection(self) -> bool {
        !matches!(self, FailureKind::OperationFailure)
    }
}

/// Selects which policies wrap a call.
///
/// All policies are enabled by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PolicyFlags {
    pub time_limiter: bool,
    pub bulkhead: bool,
    pub rate_limiter: bool,
    pub retry: bool,
    pub circuit_breaker: bool,
}

impl Default for PolicyFlags {
    fn default() -> Self {
        Self::all()
    }
}

impl PolicyFlags {
    pub const fn all() -> Self {
        Self {
            time_limiter: true,
            bulkhead: true,
            rate_limiter: true,
            retry: true,
            circuit_breaker: true,
        }
    }

    pub const fn none() -> Self {
        Self {
            time_limiter: false,
            bulkhead: false,
            rate_limiter: false,
            retry: false,
            circuit_breaker: false,
        }
    }

    pub const fn without_retry(mut self) -> Self {
        self.retry = false;
        self
    }

    pub const fn without_time_limiter(mut self) -> Self {
        self.time_limiter = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrips_through_u8() {
        for state in [
            CircuitState::Closed,
            CircuitState::Open,
            CircuitState::HalfOpen,
            CircuitState::ForcedOpen,
            CircuitState::ForcedClosed,
        ] {
            assert_eq!(CircuitState::from_u8(state.as_u8()), state);
        }
    }

    #[test]
    fn test_health_mapping() {
        assert_eq!(CircuitState::Open.health(), HealthStatus::Down);
        assert_eq!(CircuitState::ForcedOpen.health(), HealthStatus::Down);
        assert_eq!(CircuitState::HalfOpen.health(), HealthStatus::Up);
        assert_eq!(CircuitState::Closed.health().to_string(), "UP");
    }

    #[test]
    fn test_rejection_kinds() {
        assert!(!FailureKind::OperationFailure.is_rejection());
        assert!(FailureKind::CircuitOpen.is_rejection());
        assert!(FailureKind::Timeout.is_rejection());
    }
}
