//! Metric events.
//!
//! Every policy reports state transitions and call outcomes as
//! [`MetricEvent`]s. The core only produces the stream; exporting it is
//! left to whatever [`MetricSink`] the host installs.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::{CircuitState, ComponentKind, FailureKind};

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventOutcome {
    /// Circuit breaker short-circuited a call
    CallNotPermitted,

    Success { duration_ms: u64 },

    Failure { duration_ms: u64 },

    /// Call crossed the slow call threshold
    SlowCall { duration_ms: u64 },

    StateTransition { from: CircuitState, to: CircuitState },

    /// Window cleared by an operator
    Reset,

    SuccessWithoutRetry,

    SuccessAfterRetry { attempts: u32 },

    RetryScheduled { attempt: u32, wait_ms: u64 },

    RetryExhausted { attempts: u32 },

    BulkheadAcquired,

    BulkheadFull,

    PermitAcquired,

    RateLimited,

    Timeout { after_ms: u64 },

    /// A late result arrived after the caller already saw a timeout
    ResultDiscarded,

    FallbackApplied { cause: FailureKind },
}

impl EventOutcome {
    /// Stable dotted name, suitable as a metric key.
    pub fn name(&self) -> &'static str {
        match self {
            EventOutcome::CallNotPermitted => "call.not_permitted",
            EventOutcome::Success { .. } => "call.success",
            EventOutcome::Failure { .. } => "call.failure",
            EventOutcome::SlowCall { .. } => "call.slow",
            EventOutcome::StateTransition { .. } => "state.transition",
            EventOutcome::Reset => "state.reset",
            EventOutcome::SuccessWithoutRetry => "retry.success_without_retry",
            EventOutcome::SuccessAfterRetry { .. } => "retry.success_after_retry",
            EventOutcome::RetryScheduled { .. } => "retry.scheduled",
            EventOutcome::RetryExhausted { .. } => "retry.exhausted",
            EventOutcome::BulkheadAcquired => "bulkhead.acquired",
            EventOutcome::BulkheadFull => "bulkhead.full",
            EventOutcome::PermitAcquired => "rate_limiter.acquired",
            EventOutcome::RateLimited => "rate_limiter.limited",
            EventOutcome::Timeout { .. } => "time_limiter.timeout",
            EventOutcome::ResultDiscarded => "time_limiter.discarded",
            EventOutcome::FallbackApplied { .. } => "fallback.applied",
        }
    }
}

/// Immutable record of a single policy event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricEvent {
    pub instance_name: String,
    pub component: ComponentKind,
    pub outcome: EventOutcome,
    pub timestamp: DateTime<Utc>,
}

impl MetricEvent {
    pub fn new(instance_name: impl Into<String>, component: ComponentKind, outcome: EventOutcome) -> Self {
        Self {
            instance_name: instance_name.into(),
            component,
            outcome,
            timestamp: Utc::now(),
        }
    }
}

/// Consumer of metric events.
///
/// Implementations are called inline on the caller's task and must not block.
pub trait MetricSink: Send + Sync {
    fn record(&self, event: &MetricEvent);
}

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricSink for NoopSink {
    fn record(&self, _event: &MetricEvent) {}
}

/// Logs every event through `tracing` at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricSink for TracingSink {
    fn record(&self, event: &MetricEvent) {
        tracing::debug!(
            instance = %event.instance_name,
            component = event.component.as_str(),
            event = event.outcome.name(),
            outcome = ?event.outcome,
            "metric event"
        );
    }
}

/// Keeps events in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<MetricEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything recorded so far.
    pub fn events(&self) -> Vec<MetricEvent> {
        self.events.lock().clone()
    }

    /// Number of events with the given dotted name.
    pub fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.outcome.name() == name)
            .count()
    }

    /// Number of events with the given name for one instance.
    pub fn count_for(&self, instance: &str, name: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.instance_name == instance && e.outcome.name() == name)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl MetricSink for MemorySink {
    fn record(&self, event: &MetricEvent) {
        self.events.lock().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_counts_by_name() {
        let sink = MemorySink::new();
        sink.record(&MetricEvent::new("db", ComponentKind::Bulkhead, EventOutcome::BulkheadFull));
        sink.record(&MetricEvent::new("db", ComponentKind::Bulkhead, EventOutcome::BulkheadAcquired));
        sink.record(&MetricEvent::new("api", ComponentKind::Bulkhead, EventOutcome::BulkheadFull));

        assert_eq!(sink.count("bulkhead.full"), 2);
        assert_eq!(sink.count_for("db", "bulkhead.full"), 1);
        assert_eq!(sink.events().len(), 3);

        sink.clear();
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = MetricEvent::new(
            "db",
            ComponentKind::Manager,
            EventOutcome::FallbackApplied {
                cause: FailureKind::CircuitOpen,
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["outcome"]["type"], "fallback_applied");
        assert_eq!(json["outcome"]["cause"], "CIRCUIT_OPEN");
        assert_eq!(json["component"], "manager");
    }
}
