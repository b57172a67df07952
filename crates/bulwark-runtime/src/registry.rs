//! Registry of named policy instances.
//!
//! Every dependency name maps to one [`PolicyInstance`] holding its five
//! policies. Instances are created on first lookup from the registry's
//! defaults plus any override installed with
//! [`configure`](PolicyRegistry::configure), and are shared by every call
//! for that name until [`clear_cache`](PolicyRegistry::clear_cache).

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use bulwark_core::{
    CircuitBreaker, Clock, ConfigError, CustomConfig, MetricSink, PolicyConfig, PolicyFile,
    RetryConfig, TimeLimiterConfig, TracingSink,
};

use crate::metrics::{CallCounters, InstanceMetrics};
use crate::resilience::{Bulkhead, RateLimiter, Retry, TimeLimiter};

/// Reads tokio's clock, so a paused test runtime also pauses the circuit
/// breaker's open wait.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

/// The policies guarding one named dependency.
pub struct PolicyInstance {
    name: String,
    config: PolicyConfig,
    circuit_breaker: CircuitBreaker,
    bulkhead: Bulkhead,
    rate_limiter: RateLimiter,
    retry: Retry,
    time_limiter: TimeLimiter,
    calls: CallCounters,
}

impl PolicyInstance {
    fn new(
        name: &str,
        config: PolicyConfig,
        retry_config: Arc<RetryConfig>,
        time_limiter_config: Arc<TimeLimiterConfig>,
        sink: &Arc<dyn MetricSink>,
    ) -> Self {
        Self {
            name: name.to_string(),
            circuit_breaker: CircuitBreaker::with_clock(
                name,
                config.circuit_breaker.clone(),
                sink.clone(),
                Arc::new(TokioClock),
            ),
            bulkhead: Bulkhead::new(name, config.bulkhead.clone(), sink.clone()),
            rate_limiter: RateLimiter::new(name, config.rate_limiter.clone(), sink.clone()),
            retry: Retry::new(name, retry_config, sink.clone()),
            time_limiter: TimeLimiter::new(name, time_limiter_config, sink.clone()),
            calls: CallCounters::default(),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolved configuration this instance was built from.
    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    pub fn bulkhead(&self) -> &Bulkhead {
        &self.bulkhead
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn retry(&self) -> &Retry {
        &self.retry
    }

    pub fn time_limiter(&self) -> &TimeLimiter {
        &self.time_limiter
    }

    pub(crate) fn calls(&self) -> &CallCounters {
        &self.calls
    }

    pub fn metrics(&self) -> InstanceMetrics {
        let circuit_breaker = self.circuit_breaker.metrics();
        InstanceMetrics {
            name: self.name.clone(),
            state: circuit_breaker.state,
            health: circuit_breaker.state.health(),
            circuit_breaker,
            bulkhead: self.bulkhead.metrics(),
            rate_limiter: self.rate_limiter.metrics(),
            retry: self.retry.metrics(),
            calls: self.calls.snapshot(),
        }
    }
}

impl std::fmt::Debug for PolicyInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyInstance")
            .field("name", &self.name)
            .field("state", &self.circuit_breaker.state())
            .finish_non_exhaustive()
    }
}

/// Owns every [`PolicyInstance`], keyed by dependency name.
///
/// # Lifecycle
/// - Overrides are installed with `configure` before first use
/// - `instance` creates on first lookup (compute-if-absent under a write lock)
/// - `clear_cache` drops all instances; overrides survive and apply to the
///   recreated instances
pub struct PolicyRegistry {
    defaults: PolicyConfig,
    /// Retry and time limiter configs are immutable; instances without an
    /// override share these.
    default_retry: Arc<RetryConfig>,
    default_time_limiter: Arc<TimeLimiterConfig>,
    overrides: RwLock<HashMap<String, PolicyConfig>>,
    instances: RwLock<HashMap<String, Arc<PolicyInstance>>>,
    sink: Arc<dyn MetricSink>,
}

impl PolicyRegistry {
    /// Create a registry whose instances start from `defaults`.
    pub fn new(defaults: PolicyConfig, sink: Arc<dyn MetricSink>) -> Result<Self, ConfigError> {
        defaults.validate()?;
        Ok(Self::from_validated(defaults, sink))
    }

    /// Built-in defaults, metric events logged through `tracing`.
    pub fn with_defaults() -> Self {
        let defaults = PolicyConfig::default();
        debug_assert!(defaults.validate().is_ok(), "built-in defaults must validate");
        Self::from_validated(defaults, Arc::new(TracingSink))
    }

    /// Caller has validated `defaults`.
    fn from_validated(defaults: PolicyConfig, sink: Arc<dyn MetricSink>) -> Self {
        Self {
            default_retry: Arc::new(defaults.retry.clone()),
            default_time_limiter: Arc::new(defaults.time_limiter.clone()),
            defaults,
            overrides: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
            sink,
        }
    }

    /// Build a registry from a policy file, installing its per-instance overrides.
    pub fn from_policy_file(file: &PolicyFile, sink: Arc<dyn MetricSink>) -> Result<Self, ConfigError> {
        let registry = Self::new(file.base_config()?, sink)?;
        for (name, overrides) in &file.instances {
            registry.configure(name, overrides)?;
        }
        Ok(registry)
    }

    pub fn defaults(&self) -> &PolicyConfig {
        &self.defaults
    }

    pub fn sink(&self) -> &Arc<dyn MetricSink> {
        &self.sink
    }

    /// Install overrides for `name`, replacing any earlier ones.
    ///
    /// Overrides are applied to the registry defaults, never on top of a
    /// previous override, so configuring twice with the same values yields
    /// the same instance. An instance that already exists keeps its
    /// configuration until the cache is cleared.
    pub fn configure(&self, name: &str, overrides: &CustomConfig) -> Result<(), ConfigError> {
        let resolved = overrides.apply_to(&self.defaults)?;

        if self.instances.read().contains_key(name) {
            tracing::warn!(
                name,
                "Instance already created, configuration applies after clear_cache"
            );
        }

        tracing::debug!(name, "Installed policy overrides");
        self.overrides.write().insert(name.to_string(), resolved);
        Ok(())
    }

    /// The instance for `name`, creating it on first use.
    pub fn instance(&self, name: &str) -> Arc<PolicyInstance> {
        if let Some(instance) = self.instances.read().get(name) {
            return instance.clone();
        }

        let mut instances = self.instances.write();
        instances
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(self.build(name)))
            .clone()
    }

    /// The instance for `name`, if it has been created.
    pub fn get(&self, name: &str) -> Option<Arc<PolicyInstance>> {
        self.instances.read().get(name).cloned()
    }

    /// All created instances, ordered by name.
    pub fn instances(&self) -> Vec<Arc<PolicyInstance>> {
        let mut instances: Vec<_> = self.instances.read().values().cloned().collect();
        instances.sort_by(|a, b| a.name().cmp(b.name()));
        instances
    }

    /// Names of all created instances, sorted.
    pub fn instance_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.instances.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Drop every instance. Calls already holding one finish against it.
    pub fn clear_cache(&self) {
        let dropped = {
            let mut instances = self.instances.write();
            let count = instances.len();
            instances.clear();
            count
        };
        tracing::info!(dropped, "Cleared policy instance cache");
    }

    fn build(&self, name: &str) -> PolicyInstance {
        let config = self
            .overrides
            .read()
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone());

        let retry = if config.retry == self.defaults.retry {
            self.default_retry.clone()
        } else {
            Arc::new(config.retry.clone())
        };
        let time_limiter = if config.time_limiter == self.defaults.time_limiter {
            self.default_time_limiter.clone()
        } else {
            Arc::new(config.time_limiter.clone())
        };

        tracing::debug!(name, "Creating policy instance");
        PolicyInstance::new(name, config, retry, time_limiter, &self.sink)
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_core::{CircuitState, NoopSink};
    use std::time::Duration;

    fn registry() -> PolicyRegistry {
        PolicyRegistry::new(PolicyConfig::default(), Arc::new(NoopSink)).unwrap()
    }

    #[test]
    fn test_instance_created_once() {
        let registry = registry();
        let a = registry.instance("db");
        let b = registry.instance("db");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.instance_names(), vec!["db".to_string()]);
    }

    #[test]
    fn test_names_do_not_share_state() {
        let registry = registry();
        registry.instance("db").circuit_breaker().force_open();
        assert_eq!(registry.instance("cache").circuit_breaker().state(), CircuitState::Closed);
    }

    #[test]
    fn test_default_configs_are_shared() {
        let registry = registry();
        let a = registry.instance("a");
        let b = registry.instance("b");
        assert!(Arc::ptr_eq(a.retry().config(), b.retry().config()));
        assert!(Arc::ptr_eq(a.time_limiter().config(), b.time_limiter().config()));
    }

    #[test]
    fn test_configure_before_first_use() {
        let registry = registry();
        let overrides = CustomConfig {
            max_attempts: Some(5),
            ring_buffer_size_in_closed_state: Some(20),
            ..Default::default()
        };
        registry.configure("db", &overrides).unwrap();

        let instance = registry.instance("db");
        assert_eq!(instance.retry().config().max_attempts, 5);
        assert_eq!(instance.config().circuit_breaker.ring_buffer_size_in_closed_state, 20);
        assert!(!Arc::ptr_eq(
            instance.retry().config(),
            registry.instance("other").retry().config()
        ));
    }

    #[test]
    fn test_configure_twice_is_idempotent() {
        let registry = registry();
        let overrides = CustomConfig {
            failure_rate_threshold: Some(25.0),
            ..Default::default()
        };
        registry.configure("db", &overrides).unwrap();
        registry.configure("db", &overrides).unwrap();

        let config = registry.instance("db").config().clone();
        assert_eq!(config, overrides.apply_to(&PolicyConfig::default()).unwrap());
    }

    #[test]
    fn test_configure_rejects_invalid_values() {
        let registry = registry();
        let overrides = CustomConfig {
            failure_rate_threshold: Some(-1.0),
            ..Default::default()
        };
        assert!(registry.configure("db", &overrides).is_err());
        assert!(registry.instance("db").config() == registry.defaults());
    }

    #[test]
    fn test_configure_after_creation_waits_for_clear_cache() {
        let registry = registry();
        let before = registry.instance("db");

        let overrides = CustomConfig {
            timeout_duration: Some(Duration::from_millis(250)),
            ..Default::default()
        };
        registry.configure("db", &overrides).unwrap();
        assert!(Arc::ptr_eq(&before, &registry.instance("db")));
        assert_eq!(before.time_limiter().config().timeout_duration, Duration::from_secs(10));

        registry.clear_cache();
        assert!(registry.get("db").is_none());
        let after = registry.instance("db");
        assert_eq!(after.time_limiter().config().timeout_duration, Duration::from_millis(250));
    }

    #[test]
    fn test_from_policy_file() {
        let yaml = r#"
defaults:
  maxAttempts: 2
instances:
  search:
    maxConcurrentCalls: 4
    timeoutDuration: 300ms
"#;
        let file = PolicyFile::from_yaml(yaml).unwrap();
        let registry = PolicyRegistry::from_policy_file(&file, Arc::new(NoopSink)).unwrap();

        assert_eq!(registry.defaults().retry.max_attempts, 2);
        let search = registry.instance("search");
        assert_eq!(search.config().bulkhead.max_concurrent_calls, 4);
        assert_eq!(search.config().retry.max_attempts, 2);
        assert_eq!(search.bulkhead().available(), 4);
    }

    #[test]
    fn test_with_defaults_matches_validated_registry() {
        let built_in = PolicyRegistry::with_defaults();
        assert!(built_in.defaults().validate().is_ok());

        let validated = registry();
        assert_eq!(built_in.defaults(), validated.defaults());
        assert_eq!(built_in.instance("db").config(), validated.instance("db").config());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_wait_follows_tokio_time() {
        let registry = registry();
        let overrides = CustomConfig {
            ring_buffer_size_in_closed_state: Some(2),
            wait_duration_in_open_state: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        registry.configure("db", &overrides).unwrap();
        let instance = registry.instance("db");
        let breaker = instance.circuit_breaker();

        breaker.on_failure(Duration::from_millis(5));
        breaker.on_failure(Duration::from_millis(5));
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!breaker.permit().is_allowed());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(breaker.permit().is_allowed());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_concurrent_first_use_creates_one_instance() {
        let registry = Arc::new(registry());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.instance("shared"))
            })
            .collect();

        let instances: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(instances.iter().all(|i| Arc::ptr_eq(i, &instances[0])));
    }
}
