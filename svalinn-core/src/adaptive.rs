//! Adaptive retry policy driven by observed per-service error rates
//!
//! Tracks success/error counts per upstream service and escalates the
//! retry profile as a service deteriorates: more attempts with longer
//! initial delays while calls keep failing. Lazily creates one circuit
//! breaker per service so a deteriorating upstream is also isolated.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use crate::breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::error::{ResilienceError, UpstreamError};
use crate::monitoring::MetricsRegistry;
use crate::retry::{RetryConfig, RetryEngine, RetryObserver};

/// Escalate to the aggressive profile above this error rate
const AGGRESSIVE_THRESHOLD: f64 = 0.5;
/// Escalate to the moderate profile above this error rate
const MODERATE_THRESHOLD: f64 = 0.2;

/// Cumulative call counters for one service
#[derive(Debug, Default, Clone, Serialize)]
pub struct ServiceCallStats {
    pub success_count: u64,
    pub error_count: u64,
}

impl ServiceCallStats {
    /// `error_count / max(success_count, 1)`
    pub fn error_rate(&self) -> f64 {
        self.error_count as f64 / self.success_count.max(1) as f64
    }
}

/// Per-service adaptive retry front end
pub struct SmartRetryPolicy {
    stats: DashMap<String, ServiceCallStats>,
    breakers: DashMap<String, CircuitBreaker>,
    breaker_config: CircuitBreakerConfig,
    observers: Vec<Arc<dyn RetryObserver>>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl SmartRetryPolicy {
    /// Create a policy; per-service breakers are created lazily with this config
    pub fn new(breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            stats: DashMap::new(),
            breakers: DashMap::new(),
            breaker_config,
            observers: Vec::new(),
            metrics: None,
        }
    }

    /// Subscribe a retry observer passed to every engine this policy builds
    pub fn with_observer(mut self, observer: Arc<dyn RetryObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Attach Prometheus handles; call once at construction time
    pub fn with_metrics(mut self, registry: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(registry);
        self
    }

    /// Retry profile for a service given its current error rate:
    /// > 0.5 aggressive, > 0.2 moderate, otherwise the default profile
    pub fn config_for(&self, service: &str) -> RetryConfig {
        let rate = self.error_rate(service);
        if rate > AGGRESSIVE_THRESHOLD {
            RetryConfig::aggressive()
        } else if rate > MODERATE_THRESHOLD {
            RetryConfig::moderate()
        } else {
            RetryConfig::default()
        }
    }

    /// Observed error rate for a service (0.0 when never called)
    pub fn error_rate(&self, service: &str) -> f64 {
        self.stats
            .get(service)
            .map(|s| s.error_rate())
            .unwrap_or(0.0)
    }

    /// Counter snapshot for one service
    pub fn stats_for(&self, service: &str) -> ServiceCallStats {
        self.stats
            .get(service)
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Counter snapshot across all services, for dashboards
    pub fn all_stats(&self) -> BTreeMap<String, ServiceCallStats> {
        self.stats
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Forget a service's history (operator action after an incident)
    pub fn reset_stats(&self, service: &str) {
        self.stats.remove(service);
    }

    /// The breaker guarding a service, created on first use
    pub fn breaker(&self, service: &str) -> CircuitBreaker {
        self.breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                let breaker = CircuitBreaker::new(service, self.breaker_config.clone());
                match &self.metrics {
                    Some(registry) => breaker.with_metrics(registry),
                    None => breaker,
                }
            })
            .clone()
    }

    /// Record one successful call against a service
    pub fn record_success(&self, service: &str) {
        self.stats
            .entry(service.to_string())
            .or_default()
            .success_count += 1;
    }

    /// Record one failed call against a service
    pub fn record_error(&self, service: &str) {
        self.stats.entry(service.to_string()).or_default().error_count += 1;
    }

    /// Run one call with the profile adapted to this service, routed
    /// through the service's breaker. Counters update on every outcome,
    /// including fail-fast rejections.
    pub async fn run<T, F, Fut>(&self, service: &str, op: F) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let config = self.config_for(service);
        debug!(
            "Retry profile for '{}': {} retries, initial delay {:?} (error rate {:.2})",
            service,
            config.max_retries,
            config.initial_delay,
            self.error_rate(service)
        );

        let breaker = self.breaker(service);
        let mut engine = RetryEngine::new(config);
        for observer in &self.observers {
            engine = engine.with_observer(Arc::clone(observer));
        }
        if let Some(registry) = &self.metrics {
            engine = engine.with_metrics(registry);
        }

        let result = engine.execute_with_breaker(op, &breaker).await;
        match &result {
            Ok(_) => self.record_success(service),
            Err(_) => self.record_error(service),
        }
        result
    }
}

impl Default for SmartRetryPolicy {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[test]
    fn test_error_rate_with_no_successes() {
        let policy = SmartRetryPolicy::default();
        policy.record_error("api");
        // Divides by max(successes, 1)
        assert!((policy.error_rate("api") - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_profile_escalation_thresholds() {
        let policy = SmartRetryPolicy::default();

        // Never seen: default profile
        assert_eq!(policy.config_for("quiet").max_retries, 3);

        // 1 error / 4 successes = 0.25: moderate
        for _ in 0..4 {
            policy.record_success("wobbly");
        }
        policy.record_error("wobbly");
        assert_eq!(policy.config_for("wobbly").max_retries, 4);

        // 2 errors / 1 success = 2.0: aggressive
        policy.record_success("broken");
        policy.record_error("broken");
        policy.record_error("broken");
        assert_eq!(policy.config_for("broken").max_retries, 5);
    }

    #[test]
    fn test_rate_exactly_at_threshold_does_not_escalate() {
        let policy = SmartRetryPolicy::default();

        // 1 error / 2 successes = 0.5: still moderate, not aggressive
        policy.record_success("edge");
        policy.record_success("edge");
        policy.record_error("edge");
        assert_eq!(policy.config_for("edge").max_retries, 4);
    }

    #[test]
    fn test_services_tracked_independently() {
        let policy = SmartRetryPolicy::default();

        policy.record_error("a");
        policy.record_error("a");
        policy.record_success("b");

        assert!(policy.error_rate("a") > 1.0 - f64::EPSILON);
        assert!(policy.error_rate("b") < f64::EPSILON);
        assert_eq!(policy.all_stats().len(), 2);
    }

    #[test]
    fn test_breaker_created_once_per_service() {
        let policy = SmartRetryPolicy::default();

        let first = policy.breaker("api");
        first.force_open();
        // Same underlying breaker comes back
        let second = policy.breaker("api");
        assert_eq!(second.state(), crate::breaker::CircuitState::Open);
    }

    #[test]
    fn test_reset_stats() {
        let policy = SmartRetryPolicy::default();
        policy.record_error("api");
        policy.reset_stats("api");
        assert!(policy.error_rate("api") < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_updates_counters() {
        let policy = SmartRetryPolicy::new(CircuitBreakerConfig {
            failure_threshold: 100,
            recovery_timeout: Duration::from_secs(60),
        });

        let out = policy.run("api", || async { Ok::<_, UpstreamError>(1) }).await;
        assert!(out.is_ok());

        let out: Result<u32, _> = policy
            .run("api", || async {
                Err(UpstreamError::Status { status: 500 })
            })
            .await;
        assert!(out.is_err());

        let stats = policy.stats_for("api");
        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.error_count, 1);
    }

    #[tokio::test]
    async fn test_run_counts_fail_fast_rejections() {
        let policy = SmartRetryPolicy::default();
        policy.breaker("api").force_open();

        let calls = AtomicU32::new(0);
        let out: Result<u32, _> = policy
            .run("api", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(1) }
            })
            .await;

        assert!(matches!(out, Err(ResilienceError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(policy.stats_for("api").error_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_service_gets_more_attempts() {
        let policy = SmartRetryPolicy::new(CircuitBreakerConfig {
            failure_threshold: 1000,
            recovery_timeout: Duration::from_secs(60),
        });

        // Push the error rate over the aggressive threshold
        for _ in 0..3 {
            policy.record_error("flaky");
        }
        policy.record_success("flaky");

        let calls = AtomicU32::new(0);
        let _: Result<u32, _> = policy
            .run("flaky", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(UpstreamError::Status { status: 503 }) }
            })
            .await;

        // Aggressive profile: 5 retries = 6 attempts
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }
}
