//! Circuit breaker to stop calling a failing dependency.
//!
//! # States
//! - Closed: every call passes, outcomes fill a sliding window
//! - Open: calls are rejected without reaching the dependency
//! - Half-Open: a fixed batch of trial calls decides whether to close
//!
//! # State Transitions
//! ```text
//! Closed → Open:      window full and failure (or slow call) rate >= threshold
//! Open → Half-Open:   first permission check after the open wait elapsed
//! Half-Open → Closed: trial batch finished below the thresholds
//! Half-Open → Open:   trial batch finished at or above a threshold
//! ```
//!
//! Operators can pin the breaker with [`CircuitBreaker::force_open`] or
//! [`CircuitBreaker::force_closed`]; [`CircuitBreaker::reset`] hands control
//! back to the automatic machine with an empty window.
//!
//! The state lives in an atomic so reads never lock. Every write happens
//! while holding the window lock, so outcome recording, threshold
//! evaluation and the resulting transition form one atomic step.
//!
//! Each state change starts a new generation. A [`CallPermit`] remembers the
//! generation that admitted its call, and an outcome reported against an
//! older generation is dropped, so a slow call admitted while CLOSED cannot
//! spend a HALF_OPEN trial slot.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock::{Clock, SystemClock};
use crate::config::CircuitBreakerConfig;
use crate::events::{EventOutcome, MetricEvent, MetricSink};
use crate::types::{CircuitState, ComponentKind, PermissionResult};

#[derive(Debug, Clone, Copy)]
struct CallRecord {
    failed: bool,
    slow: bool,
}

/// Ring buffer of the most recent outcomes plus the open/half-open bookkeeping.
#[derive(Debug)]
struct Window {
    records: VecDeque<CallRecord>,
    capacity: usize,
    failures: usize,
    slow: usize,
    opened_at: Option<Instant>,
    half_open_permits: usize,
}

impl Window {
    fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
            failures: 0,
            slow: 0,
            opened_at: None,
            half_open_permits: 0,
        }
    }

    fn clear(&mut self, capacity: usize) {
        self.records.clear();
        self.capacity = capacity;
        self.failures = 0;
        self.slow = 0;
    }

    fn push(&mut self, record: CallRecord) {
        if self.records.len() == self.capacity {
            if let Some(evicted) = self.records.pop_front() {
                self.failures -= evicted.failed as usize;
                self.slow -= evicted.slow as usize;
            }
        }
        self.failures += record.failed as usize;
        self.slow += record.slow as usize;
        self.records.push_back(record);
    }

    fn is_full(&self) -> bool {
        self.records.len() >= self.capacity
    }

    fn failure_rate(&self) -> f64 {
        rate(self.failures, self.records.len())
    }

    fn slow_call_rate(&self) -> f64 {
        rate(self.slow, self.records.len())
    }
}

fn rate(count: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 * 100.0 / total as f64
    }
}

/// Point-in-time view of a circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    /// Percentage of failed calls in the current window
    pub failure_rate: f64,
    /// Percentage of slow calls in the current window
    pub slow_call_rate: f64,
    pub buffered_calls: usize,
    pub failed_calls: usize,
    pub slow_calls: usize,
    pub not_permitted_calls: u64,
}

/// Admission granted by [`CircuitBreaker::acquire_permission`].
///
/// Hand it back with [`CircuitBreaker::record_success`] or
/// [`CircuitBreaker::record_failure`] once the call finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallPermit {
    generation: u64,
}

/// Failure-rate circuit breaker for one dependency.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    /// Bumped on every state change, only while holding the window lock
    generation: AtomicU64,
    window: Mutex<Window>,
    not_permitted: AtomicU64,
    sink: Arc<dyn MetricSink>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    /// Create a closed circuit breaker on the system clock.
    pub fn new(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        sink: Arc<dyn MetricSink>,
    ) -> Self {
        Self::with_clock(name, config, sink, Arc::new(SystemClock))
    }

    /// Create a closed circuit breaker that measures the open wait on `clock`.
    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        sink: Arc<dyn MetricSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let window = Window::new(config.ring_buffer_size_in_closed_state);
        Self {
            name: name.into(),
            config,
            state: AtomicU8::new(CircuitState::Closed.as_u8()),
            generation: AtomicU64::new(0),
            window: Mutex::new(window),
            not_permitted: AtomicU64::new(0),
            sink,
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state.
    ///
    /// An expired OPEN state is reported as OPEN until the next
    /// [`permit`](Self::permit) moves it to HALF_OPEN.
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Ask to make a call.
    ///
    /// In HALF_OPEN each allowed call consumes one trial permit.
    pub fn permit(&self) -> PermissionResult {
        match self.acquire_permission() {
            Some(_) => PermissionResult::Allowed,
            None => PermissionResult::Rejected,
        }
    }

    /// Like [`permit`](Self::permit), but returns the permit to report the
    /// call's outcome with.
    pub fn acquire_permission(&self) -> Option<CallPermit> {
        // Generation first: a state change in between makes the permit stale
        // rather than letting it pass as current.
        let generation = self.generation.load(Ordering::Acquire);
        let permit = match self.state() {
            CircuitState::Closed | CircuitState::ForcedClosed => {
                return Some(CallPermit { generation })
            }
            CircuitState::ForcedOpen => None,
            CircuitState::Open | CircuitState::HalfOpen => self.permit_slow_path(),
        };

        if permit.is_none() {
            self.not_permitted.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(name = %self.name, "Circuit open, call not permitted");
            self.emit(EventOutcome::CallNotPermitted);
        }
        permit
    }

    fn permit_slow_path(&self) -> Option<CallPermit> {
        let mut window = self.window.lock();
        let mut transition = None;

        // State is re-read under the lock; another caller may have moved it.
        let allowed = match self.state() {
            CircuitState::Open => {
                let expired = window
                    .opened_at
                    .map(|at| {
                        self.clock.now().saturating_duration_since(at)
                            >= self.config.wait_duration_in_open_state
                    })
                    .unwrap_or(true);
                if expired {
                    transition =
                        self.transition(&mut window, CircuitState::Open, CircuitState::HalfOpen);
                    self.take_trial_permit(&mut window)
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => self.take_trial_permit(&mut window),
            CircuitState::ForcedOpen => false,
            CircuitState::Closed | CircuitState::ForcedClosed => true,
        };
        let permit = allowed.then(|| CallPermit {
            generation: self.generation.load(Ordering::Acquire),
        });
        drop(window);

        self.emit_transition(transition);
        permit
    }

    fn take_trial_permit(&self, window: &mut Window) -> bool {
        if window.half_open_permits > 0 {
            window.half_open_permits -= 1;
            true
        } else {
            false
        }
    }

    /// Record a successful call.
    ///
    /// Counts as slow when `duration` reaches the slow call threshold. The
    /// outcome is attributed to whatever state the breaker is in now; use
    /// [`record_success`](Self::record_success) for calls that may outlive a
    /// state change.
    pub fn on_success(&self, duration: Duration) {
        self.record(self.success_record(duration), duration, None);
    }

    /// Record a failed call against the current state.
    pub fn on_failure(&self, duration: Duration) {
        self.record(self.failure_record(duration), duration, None);
    }

    /// Record a call that succeeded but is known to be slow.
    pub fn on_slow(&self, duration: Duration) {
        let record = CallRecord {
            failed: false,
            slow: true,
        };
        self.record(record, duration, None);
    }

    /// Record a successful call admitted by `permit`.
    ///
    /// Ignored when the breaker changed state since the permit was issued.
    pub fn record_success(&self, permit: CallPermit, duration: Duration) {
        self.record(self.success_record(duration), duration, Some(permit));
    }

    /// Record a failed call admitted by `permit`.
    ///
    /// Ignored when the breaker changed state since the permit was issued.
    pub fn record_failure(&self, permit: CallPermit, duration: Duration) {
        self.record(self.failure_record(duration), duration, Some(permit));
    }

    fn success_record(&self, duration: Duration) -> CallRecord {
        CallRecord {
            failed: false,
            slow: self.is_slow(duration),
        }
    }

    fn failure_record(&self, duration: Duration) -> CallRecord {
        CallRecord {
            failed: true,
            slow: self.is_slow(duration),
        }
    }

    fn is_slow(&self, duration: Duration) -> bool {
        duration >= self.config.slow_call_duration_threshold
    }

    fn record(&self, record: CallRecord, duration: Duration, permit: Option<CallPermit>) {
        let duration_ms = duration.as_millis() as u64;
        self.emit(if record.failed {
            EventOutcome::Failure { duration_ms }
        } else {
            EventOutcome::Success { duration_ms }
        });
        if record.slow {
            self.emit(EventOutcome::SlowCall { duration_ms });
        }

        let mut window = self.window.lock();
        if let Some(permit) = permit {
            if permit.generation != self.generation.load(Ordering::Acquire) {
                tracing::debug!(
                    name = %self.name,
                    state = %self.state(),
                    "Ignoring outcome of a call admitted before the last state change"
                );
                return;
            }
        }
        let transition = match self.state() {
            CircuitState::Closed => {
                window.push(record);
                if window.is_full() && self.exceeds_thresholds(&window) {
                    self.trip(&mut window, CircuitState::Closed)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                window.push(record);
                if !window.is_full() {
                    None
                } else if self.exceeds_thresholds(&window) {
                    self.trip(&mut window, CircuitState::HalfOpen)
                } else {
                    let closed =
                        self.transition(&mut window, CircuitState::HalfOpen, CircuitState::Closed);
                    window.clear(self.config.ring_buffer_size_in_closed_state);
                    closed
                }
            }
            // Late outcomes from calls admitted before the circuit opened, or
            // outcomes while an operator holds the state, are not evaluated.
            CircuitState::Open | CircuitState::ForcedOpen | CircuitState::ForcedClosed => None,
        };
        drop(window);

        self.emit_transition(transition);
    }

    fn exceeds_thresholds(&self, window: &Window) -> bool {
        window.failure_rate() >= self.config.failure_rate_threshold
            || window.slow_call_rate() >= self.config.slow_call_rate_threshold
    }

    fn trip(&self, window: &mut Window, from: CircuitState) -> Option<(CircuitState, CircuitState)> {
        let failure_rate = window.failure_rate();
        let slow_call_rate = window.slow_call_rate();
        let transition = self.transition(window, from, CircuitState::Open)?;
        window.opened_at = Some(self.clock.now());
        window.clear(self.config.ring_buffer_size_in_closed_state);
        tracing::warn!(
            name = %self.name,
            from = %from,
            failure_rate,
            slow_call_rate,
            "Circuit opened"
        );
        Some(transition)
    }

    /// Move `from` → `to`. Caller must hold the window lock.
    fn transition(
        &self,
        window: &mut Window,
        from: CircuitState,
        to: CircuitState,
    ) -> Option<(CircuitState, CircuitState)> {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        self.generation.fetch_add(1, Ordering::AcqRel);

        if to == CircuitState::HalfOpen {
            window.clear(self.config.ring_buffer_size_in_half_open_state);
            window.half_open_permits = self.config.ring_buffer_size_in_half_open_state;
            tracing::info!(name = %self.name, "Circuit half-open, admitting trial calls");
        } else if to == CircuitState::Closed && from == CircuitState::HalfOpen {
            tracing::info!(name = %self.name, "Circuit closed after successful trial calls");
        }
        Some((from, to))
    }

    /// Hold the circuit open until released.
    pub fn force_open(&self) {
        self.force(CircuitState::ForcedOpen);
    }

    /// Hold the circuit closed until released.
    pub fn force_closed(&self) {
        self.force(CircuitState::ForcedClosed);
    }

    fn force(&self, to: CircuitState) {
        let mut window = self.window.lock();
        let from = self.state();
        if from == to {
            return;
        }
        let transition = self.transition(&mut window, from, to);
        window.clear(self.config.ring_buffer_size_in_closed_state);
        drop(window);

        tracing::warn!(name = %self.name, from = %from, to = %to, "Circuit state forced");
        self.emit_transition(transition);
    }

    /// Release any manual override and restart CLOSED with an empty window.
    pub fn reset(&self) {
        let mut window = self.window.lock();
        let from = self.state();
        let transition = if from == CircuitState::Closed {
            // No transition, but calls from before the reset are still stale
            self.generation.fetch_add(1, Ordering::AcqRel);
            None
        } else {
            self.transition(&mut window, from, CircuitState::Closed)
        };
        window.clear(self.config.ring_buffer_size_in_closed_state);
        window.opened_at = None;
        window.half_open_permits = 0;
        drop(window);

        tracing::info!(name = %self.name, "Circuit reset");
        self.emit_transition(transition);
        self.emit(EventOutcome::Reset);
    }

    /// Snapshot of rates and counts.
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let window = self.window.lock();
        CircuitBreakerMetrics {
            state: self.state(),
            failure_rate: window.failure_rate(),
            slow_call_rate: window.slow_call_rate(),
            buffered_calls: window.records.len(),
            failed_calls: window.failures,
            slow_calls: window.slow,
            not_permitted_calls: self.not_permitted.load(Ordering::Relaxed),
        }
    }

    fn emit_transition(&self, transition: Option<(CircuitState, CircuitState)>) {
        if let Some((from, to)) = transition {
            self.emit(EventOutcome::StateTransition { from, to });
        }
    }

    fn emit(&self, outcome: EventOutcome) {
        self.sink
            .record(&MetricEvent::new(&self.name, ComponentKind::CircuitBreaker, outcome));
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("config", &self.config)
            .finish()
    }
}
