//! Resilience manager.
//!
//! The manager resolves the policy instance for a dependency name and runs
//! the call through the enabled policies, outermost first:
//!
//! ```text
//! TimeLimiter → Bulkhead → RateLimiter → Retry → CircuitBreaker → operation
//! ```
//!
//! # Rejections
//! A policy that refuses a call returns its rejection straight to the
//! caller. Retry only repeats the operation's own failures, so an open
//! circuit or an exhausted limiter ends the call at once.
//!
//! # Timeouts
//! With the time limiter enabled the rest of the pipeline runs on its own
//! task. On timeout the caller gets [`ResilienceError::Timeout`] without
//! waiting for that task. The task keeps its bulkhead slot until it ends,
//! and the circuit breaker still records its outcome.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use bulwark_core::{
    CallPermit, CircuitBreaker, CircuitState, ComponentKind, ConfigError, CustomConfig, EventOutcome,
    HealthStatus, MetricEvent, MetricSink, PolicyFile, PolicyFlags,
};

use crate::metrics::InstanceMetrics;
use crate::registry::{PolicyInstance, PolicyRegistry};
use crate::resilience::TimedOut;
use crate::ResilienceError;

/// Entry point for guarded calls.
///
/// Cloning is cheap; clones share the same registry.
#[derive(Clone)]
pub struct ResilienceManager {
    registry: Arc<PolicyRegistry>,
}

impl ResilienceManager {
    pub fn new(registry: PolicyRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    /// Manager over a registry with the built-in defaults.
    pub fn with_defaults() -> Self {
        Self::new(PolicyRegistry::with_defaults())
    }

    /// Manager over a registry built from a policy file.
    pub fn from_policy_file(
        file: &PolicyFile,
        sink: Arc<dyn MetricSink>,
    ) -> Result<Self, ConfigError> {
        Ok(Self::new(PolicyRegistry::from_policy_file(file, sink)?))
    }

    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    /// Run `operation` through every policy for `name`.
    pub async fn execute<T, E, F, Fut>(&self, name: &str, operation: F) -> Result<T, ResilienceError<E>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        self.execute_with_flags(name, PolicyFlags::all(), operation).await
    }

    /// Run `operation` through the policies selected by `flags`.
    pub async fn execute_with_flags<T, E, F, Fut>(
        &self,
        name: &str,
        flags: PolicyFlags,
        operation: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        self.execute_cancellable(name, flags, move |_cancel| operation())
            .await
    }

    /// Run `operation` through the policies selected by `flags`, handing it
    /// the token that is cancelled when the call times out.
    ///
    /// The token is only cancelled when the time limiter has
    /// `cancel_running_future` set. Operations that ignore it run to
    /// completion and their results are discarded.
    pub async fn execute_cancellable<T, E, F, Fut>(
        &self,
        name: &str,
        flags: PolicyFlags,
        operation: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let instance = self.registry.instance(name);
        let cancel = CancellationToken::new();

        let result = if flags.time_limiter {
            let pipeline = {
                let instance = instance.clone();
                let cancel = cancel.clone();
                async move { run_guarded(&instance, flags, &operation, &cancel).await }
            };
            match instance.time_limiter().execute(cancel, pipeline).await {
                Ok(result) => result,
                Err(TimedOut { after }) => Err(ResilienceError::Timeout {
                    name: name.to_string(),
                    after,
                }),
            }
        } else {
            run_guarded(&instance, flags, &operation, &cancel).await
        };

        instance.calls().record(&result);
        result
    }

    /// Run `operation` through every policy and fall back on any failure.
    ///
    /// Never fails: returns either the operation's value or `fallback`'s.
    pub async fn execute_with_fallback<T, E, F, Fut, FB>(
        &self,
        name: &str,
        operation: F,
        fallback: FB,
    ) -> T
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
        FB: FnOnce(ResilienceError<E>) -> T,
    {
        match self.execute(name, operation).await {
            Ok(value) => value,
            Err(err) => {
                let cause = err.kind();
                tracing::warn!(name, cause = ?cause, "Call failed, applying fallback");

                let instance = self.registry.instance(name);
                instance.calls().record_fallback();
                self.registry.sink().record(&MetricEvent::new(
                    name,
                    ComponentKind::Manager,
                    EventOutcome::FallbackApplied { cause },
                ));
                fallback(err)
            }
        }
    }

    /// Circuit breaker state for `name`.
    pub fn get_circuit_state(&self, name: &str) -> CircuitState {
        self.registry.instance(name).circuit_breaker().state()
    }

    /// Hold the circuit for `name` open until [`force_closed`](Self::force_closed)
    /// or [`reset`](Self::reset).
    pub fn force_open(&self, name: &str) {
        self.registry.instance(name).circuit_breaker().force_open();
    }

    /// Hold the circuit for `name` closed until [`force_open`](Self::force_open)
    /// or [`reset`](Self::reset).
    pub fn force_closed(&self, name: &str) {
        self.registry.instance(name).circuit_breaker().force_closed();
    }

    /// Release any manual override and restart the circuit for `name` closed
    /// with an empty window.
    pub fn reset(&self, name: &str) {
        self.registry.instance(name).circuit_breaker().reset();
    }

    /// Metrics for every created instance, keyed by name.
    pub fn get_all_metrics(&self) -> BTreeMap<String, InstanceMetrics> {
        self.registry
            .instances()
            .iter()
            .map(|instance| (instance.name().to_string(), instance.metrics()))
            .collect()
    }

    /// UP/DOWN per created instance. Open circuits report DOWN.
    pub fn health_check(&self) -> BTreeMap<String, HealthStatus> {
        self.registry
            .instances()
            .iter()
            .map(|instance| {
                let health = instance.circuit_breaker().state().health();
                (instance.name().to_string(), health)
            })
            .collect()
    }

    /// True when no circuit is open.
    pub fn is_healthy(&self) -> bool {
        self.health_check()
            .values()
            .all(|health| *health == HealthStatus::Up)
    }

    /// Install overrides for `name`. See [`PolicyRegistry::configure`].
    pub fn configure(&self, name: &str, overrides: &CustomConfig) -> Result<(), ConfigError> {
        self.registry.configure(name, overrides)
    }

    /// Drop all cached instances.
    pub fn clear_cache(&self) {
        self.registry.clear_cache();
    }

    pub fn instance_names(&self) -> Vec<String> {
        self.registry.instance_names()
    }
}

impl Default for ResilienceManager {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Bulkhead, rate limiter and retry around the circuit-breaker-guarded call.
async fn run_guarded<T, E, F, Fut>(
    instance: &PolicyInstance,
    flags: PolicyFlags,
    operation: &F,
    cancel: &CancellationToken,
) -> Result<T, ResilienceError<E>>
where
    F: Fn(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    // Held until the call, retries included, is over
    let _slot = if flags.bulkhead {
        match instance.bulkhead().acquire().await {
            Some(permit) => Some(permit),
            None => {
                return Err(ResilienceError::BulkheadFull {
                    name: instance.name().to_string(),
                })
            }
        }
    } else {
        None
    };

    if flags.rate_limiter && !instance.rate_limiter().acquire().await {
        return Err(ResilienceError::RateLimited {
            name: instance.name().to_string(),
        });
    }

    if flags.retry {
        instance
            .retry()
            .execute(|| call_downstream(instance, flags, operation, cancel))
            .await
    } else {
        call_downstream(instance, flags, operation, cancel).await
    }
}

/// One attempt: circuit breaker permission, the call, outcome recording.
async fn call_downstream<T, E, F, Fut>(
    instance: &PolicyInstance,
    flags: PolicyFlags,
    operation: &F,
    cancel: &CancellationToken,
) -> Result<T, ResilienceError<E>>
where
    F: Fn(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    // The caller already has its timeout; stop retrying a discarded call
    if cancel.is_cancelled() {
        return Err(ResilienceError::Timeout {
            name: instance.name().to_string(),
            after: instance.time_limiter().config().timeout_duration,
        });
    }

    let admitted = if flags.circuit_breaker {
        let breaker = instance.circuit_breaker();
        match breaker.acquire_permission() {
            Some(permit) => Some((breaker, permit)),
            None => {
                return Err(ResilienceError::CircuitOpen {
                    name: instance.name().to_string(),
                })
            }
        }
    } else {
        None
    };

    let mut outcome = Outcome::new(admitted);
    match operation(cancel.clone()).await {
        Ok(value) => {
            outcome.success();
            Ok(value)
        }
        Err(err) => {
            outcome.failure();
            Err(ResilienceError::Operation(err))
        }
    }
}

/// Records the call's outcome on the circuit breaker exactly once, against
/// the permit that admitted it.
///
/// A call that never completes (panic, or its future dropped) counts as a
/// failure.
struct Outcome<'a> {
    admitted: Option<(&'a CircuitBreaker, CallPermit)>,
    started: Instant,
    recorded: bool,
}

impl<'a> Outcome<'a> {
    fn new(admitted: Option<(&'a CircuitBreaker, CallPermit)>) -> Self {
        Self {
            admitted,
            started: Instant::now(),
            recorded: false,
        }
    }

    fn success(&mut self) {
        self.recorded = true;
        if let Some((breaker, permit)) = self.admitted {
            breaker.record_success(permit, self.started.elapsed());
        }
    }

    fn failure(&mut self) {
        self.recorded = true;
        if let Some((breaker, permit)) = self.admitted {
            breaker.record_failure(permit, self.started.elapsed());
        }
    }
}

impl Drop for Outcome<'_> {
    fn drop(&mut self) {
        if !self.recorded {
            self.failure();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_core::{MemorySink, PolicyConfig};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn manager_with(overrides: CustomConfig) -> (ResilienceManager, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let defaults = overrides.apply_to(&PolicyConfig::default()).unwrap();
        let registry = PolicyRegistry::new(defaults, sink.clone()).unwrap();
        (ResilienceManager::new(registry), sink)
    }

    fn fast_retries() -> CustomConfig {
        CustomConfig {
            base_wait_duration: Some(Duration::from_millis(10)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let (manager, sink) = manager_with(CustomConfig::default());

        let result: Result<u32, ResilienceError<String>> =
            manager.execute("db", || async { Ok(5) }).await;

        assert_eq!(result.unwrap(), 5);
        let metrics = &manager.get_all_metrics()["db"];
        assert_eq!(metrics.calls.successful_calls, 1);
        assert_eq!(metrics.circuit_breaker.buffered_calls, 1);
        assert_eq!(sink.count_for("db", "call.success"), 1);
        assert_eq!(sink.count_for("db", "bulkhead.acquired"), 1);
        assert_eq!(sink.count_for("db", "rate_limiter.acquired"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_retried_and_recorded_per_attempt() {
        let (manager, _sink) = manager_with(fast_retries());
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), ResilienceError<&str>> = {
            let calls = calls.clone();
            manager
                .execute("db", move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("down") }
                })
                .await
        };

        assert!(matches!(result, Err(ResilienceError::Operation("down"))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let metrics = &manager.get_all_metrics()["db"];
        assert_eq!(metrics.circuit_breaker.failed_calls, 3);
        assert_eq!(metrics.retry.failed_calls_with_retry, 1);
        assert_eq!(metrics.calls.failed_calls, 1);
    }

    #[tokio::test]
    async fn test_open_circuit_short_circuits_without_retry() {
        let (manager, _sink) = manager_with(CustomConfig::default());
        manager.force_open("db");
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), ResilienceError<&str>> = {
            let calls = calls.clone();
            manager
                .execute("db", move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                })
                .await
        };

        assert!(matches!(result, Err(ResilienceError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(manager.get_all_metrics()["db"].circuit_breaker.not_permitted_calls, 1);
    }

    #[tokio::test]
    async fn test_flags_disable_circuit_breaker() {
        let (manager, _sink) = manager_with(CustomConfig::default());
        manager.force_open("db");

        let flags = PolicyFlags {
            circuit_breaker: false,
            ..PolicyFlags::all()
        };
        let result: Result<u32, ResilienceError<&str>> = manager
            .execute_with_flags("db", flags, || async { Ok(1) })
            .await;

        assert_eq!(result.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_counts_one_permit_per_call() {
        let overrides = CustomConfig {
            permits_per_window: Some(1),
            window_duration: Some(Duration::from_secs(60)),
            ..fast_retries()
        };
        let (manager, _sink) = manager_with(overrides);

        let first: Result<(), ResilienceError<&str>> =
            manager.execute("api", || async { Err("flaky") }).await;
        assert!(matches!(first, Err(ResilienceError::Operation(_))));

        let second: Result<(), ResilienceError<&str>> =
            manager.execute("api", || async { Ok(()) }).await;
        assert!(matches!(second, Err(ResilienceError::RateLimited { .. })));
        assert_eq!(manager.get_all_metrics()["api"].calls.rate_limited_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_signals_cancellation() {
        let overrides = CustomConfig {
            timeout_duration: Some(Duration::from_millis(100)),
            cancel_running_future: Some(true),
            ..Default::default()
        };
        let (manager, _sink) = manager_with(overrides);
        let stopped = Arc::new(AtomicU32::new(0));

        let result: Result<(), ResilienceError<&str>> = {
            let stopped = stopped.clone();
            manager
                .execute_cancellable("slow", PolicyFlags::all(), move |cancel| {
                    let stopped = stopped.clone();
                    async move {
                        cancel.cancelled().await;
                        stopped.fetch_add(1, Ordering::SeqCst);
                        Err("cancelled")
                    }
                })
                .await
        };

        assert!(matches!(result, Err(ResilienceError::Timeout { .. })));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(stopped.load(Ordering::SeqCst), 1);

        let metrics = &manager.get_all_metrics()["slow"];
        assert_eq!(metrics.calls.timed_out_calls, 1);
        // The cancelled attempt is the only one; retry stops once cancelled
        assert_eq!(metrics.circuit_breaker.failed_calls, 1);
    }

    #[tokio::test]
    async fn test_fallback_used_on_rejection() {
        let (manager, sink) = manager_with(CustomConfig::default());
        manager.force_open("pricing");

        let price = manager
            .execute_with_fallback(
                "pricing",
                || async { Ok::<_, String>(100) },
                |err| {
                    assert!(err.is_rejection());
                    42
                },
            )
            .await;

        assert_eq!(price, 42);
        assert_eq!(sink.count_for("pricing", "fallback.applied"), 1);
        assert_eq!(manager.get_all_metrics()["pricing"].calls.fallbacks_applied, 1);
    }

    #[tokio::test]
    async fn test_health_check_reports_open_circuits() {
        let (manager, _sink) = manager_with(CustomConfig::default());
        assert!(manager.is_healthy());

        assert_eq!(manager.get_circuit_state("db"), CircuitState::Closed);
        manager.force_open("cache");

        let health = manager.health_check();
        assert_eq!(health["db"], HealthStatus::Up);
        assert_eq!(health["cache"], HealthStatus::Down);
        assert!(!manager.is_healthy());

        manager.reset("cache");
        assert!(manager.is_healthy());
        assert_eq!(manager.instance_names(), vec!["cache".to_string(), "db".to_string()]);
    }

    #[tokio::test]
    async fn test_panicking_operation_counts_as_failure() {
        let (manager, _sink) = manager_with(CustomConfig {
            max_attempts: Some(1),
            ..Default::default()
        });

        let task = {
            let manager = manager.clone();
            tokio::spawn(async move {
                let _: Result<(), ResilienceError<&str>> = manager
                    .execute("db", || async { panic!("driver bug") })
                    .await;
            })
        };
        assert!(task.await.is_err());

        let metrics = &manager.get_all_metrics()["db"];
        assert_eq!(metrics.circuit_breaker.failed_calls, 1);
        assert_eq!(metrics.bulkhead.active_calls, 0);
    }
}
