//! Prometheus metrics for the resilience layer
//!
//! One family group per component:
//! - Admission (rate limiter queue and cooldowns)
//! - Breaker (circuit state and rejections)
//! - Retry (attempt and exhaustion counters)
//! - Fallback (degradation activity and service level)
//! - Probe (health check outcomes and latency)
//!
//! Components hold their group by value; the handles are cheap clones
//! that all feed the same underlying families.

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};
use std::sync::Arc;
use tracing::info;

/// Central registry for all resilience metric families
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Arc<Registry>,
    admission: Arc<AdmissionMetrics>,
    breaker: Arc<BreakerMetrics>,
    retry: Arc<RetryMetrics>,
    fallback: Arc<FallbackMetrics>,
    probe: Arc<ProbeMetrics>,
}

impl MetricsRegistry {
    /// Create a registry with every metric family registered
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Arc::new(Registry::new());

        let admission = Arc::new(AdmissionMetrics::new(&registry)?);
        let breaker = Arc::new(BreakerMetrics::new(&registry)?);
        let retry = Arc::new(RetryMetrics::new(&registry)?);
        let fallback = Arc::new(FallbackMetrics::new(&registry)?);
        let probe = Arc::new(ProbeMetrics::new(&registry)?);

        info!("Prometheus metrics registry initialized");

        Ok(Self {
            registry,
            admission,
            breaker,
            retry,
            fallback,
            probe,
        })
    }

    /// Get the underlying Prometheus registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Get rate limiter metrics
    pub fn admission(&self) -> &AdmissionMetrics {
        &self.admission
    }

    /// Get circuit breaker metrics
    pub fn breaker(&self) -> &BreakerMetrics {
        &self.breaker
    }

    /// Get retry engine metrics
    pub fn retry(&self) -> &RetryMetrics {
        &self.retry
    }

    /// Get degradation metrics
    pub fn fallback(&self) -> &FallbackMetrics {
        &self.fallback
    }

    /// Get health probe metrics
    pub fn probe(&self) -> &ProbeMetrics {
        &self.probe
    }
}

impl Default for MetricsRegistry {
    #[allow(clippy::panic)] // Critical infrastructure - must succeed or abort
    fn default() -> Self {
        // Metrics creation is critical infrastructure
        // If it fails, the system cannot operate correctly
        Self::new().unwrap_or_else(|e| {
            tracing::error!("FATAL: Failed to create metrics registry: {}", e);
            panic!("Critical: Cannot create metrics registry")
        })
    }
}

/// Rate limiter admission metrics
#[derive(Clone)]
pub struct AdmissionMetrics {
    /// Calls admitted through a limiter
    pub admissions_total: IntCounterVec,
    /// Admissions abandoned at the queue timeout
    pub timeouts_total: IntCounterVec,
    /// Provider throttle responses that opened a cooldown
    pub throttle_cooldowns_total: IntCounterVec,
    /// Waiters currently queued for admission
    pub queue_depth: IntGaugeVec,
}

impl AdmissionMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let admissions_total = IntCounterVec::new(
            Opts::new("rate_limit_admissions_total", "Calls admitted through the rate limiter")
                .namespace("svalinn"),
            &["limiter"],
        )?;
        registry.register(Box::new(admissions_total.clone()))?;

        let timeouts_total = IntCounterVec::new(
            Opts::new(
                "rate_limit_timeouts_total",
                "Admissions abandoned at the queue timeout",
            )
            .namespace("svalinn"),
            &["limiter"],
        )?;
        registry.register(Box::new(timeouts_total.clone()))?;

        let throttle_cooldowns_total = IntCounterVec::new(
            Opts::new(
                "rate_limit_throttle_cooldowns_total",
                "Provider throttle responses that opened a cooldown",
            )
            .namespace("svalinn"),
            &["limiter"],
        )?;
        registry.register(Box::new(throttle_cooldowns_total.clone()))?;

        let queue_depth = IntGaugeVec::new(
            Opts::new("rate_limit_queue_depth", "Waiters currently queued for admission")
                .namespace("svalinn"),
            &["limiter"],
        )?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(Self {
            admissions_total,
            timeouts_total,
            throttle_cooldowns_total,
            queue_depth,
        })
    }
}

/// Circuit breaker metrics
#[derive(Clone)]
pub struct BreakerMetrics {
    /// Current state (0 closed, 1 open, 2 half-open)
    pub state: IntGaugeVec,
    /// State transitions, labeled by destination state
    pub transitions_total: IntCounterVec,
    /// Calls rejected while the circuit was open
    pub rejections_total: IntCounterVec,
}

impl BreakerMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let state = IntGaugeVec::new(
            Opts::new("circuit_state", "Circuit state (0 closed, 1 open, 2 half-open)")
                .namespace("svalinn"),
            &["circuit"],
        )?;
        registry.register(Box::new(state.clone()))?;

        let transitions_total = IntCounterVec::new(
            Opts::new("circuit_transitions_total", "Circuit state transitions")
                .namespace("svalinn"),
            &["circuit", "to"],
        )?;
        registry.register(Box::new(transitions_total.clone()))?;

        let rejections_total = IntCounterVec::new(
            Opts::new(
                "circuit_rejections_total",
                "Calls rejected while the circuit was open",
            )
            .namespace("svalinn"),
            &["circuit"],
        )?;
        registry.register(Box::new(rejections_total.clone()))?;

        Ok(Self {
            state,
            transitions_total,
            rejections_total,
        })
    }
}

/// Retry engine metrics
#[derive(Clone)]
pub struct RetryMetrics {
    /// Call attempts issued by retry engines
    pub attempts_total: IntCounter,
    /// Calls that exhausted their retry budget
    pub exhausted_total: IntCounter,
}

impl RetryMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let attempts_total = IntCounter::new(
            "svalinn_retry_attempts_total",
            "Call attempts issued by retry engines",
        )?;
        registry.register(Box::new(attempts_total.clone()))?;

        let exhausted_total = IntCounter::new(
            "svalinn_retry_exhausted_total",
            "Calls that exhausted their retry budget",
        )?;
        registry.register(Box::new(exhausted_total.clone()))?;

        Ok(Self {
            attempts_total,
            exhausted_total,
        })
    }
}

/// Degradation metrics
#[derive(Clone)]
pub struct FallbackMetrics {
    /// Fallback results served, by strategy
    pub fallbacks_total: IntCounterVec,
    /// Fresh cache hits that skipped the upstream call
    pub cache_hits_total: IntCounterVec,
    /// Current service level (0 full, 1 degraded, 2 minimal, 3 offline)
    pub service_level: IntGauge,
}

impl FallbackMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let fallbacks_total = IntCounterVec::new(
            Opts::new("fallback_served_total", "Fallback results served, by strategy")
                .namespace("svalinn"),
            &["service", "strategy"],
        )?;
        registry.register(Box::new(fallbacks_total.clone()))?;

        let cache_hits_total = IntCounterVec::new(
            Opts::new(
                "fallback_cache_hits_total",
                "Fresh cache hits that skipped the upstream call",
            )
            .namespace("svalinn"),
            &["service"],
        )?;
        registry.register(Box::new(cache_hits_total.clone()))?;

        let service_level = IntGauge::new(
            "svalinn_service_level",
            "Current service level (0 full, 1 degraded, 2 minimal, 3 offline)",
        )?;
        registry.register(Box::new(service_level.clone()))?;

        Ok(Self {
            fallbacks_total,
            cache_hits_total,
            service_level,
        })
    }
}

/// Health probe metrics
#[derive(Clone)]
pub struct ProbeMetrics {
    /// Probes performed, labeled ok or fail
    pub probes_total: IntCounterVec,
    /// Probed health (0 unknown, 1 healthy, 2 degraded, 3 unhealthy)
    pub status: IntGaugeVec,
    /// Probe round-trip latency
    pub latency_seconds: HistogramVec,
}

impl ProbeMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let probes_total = IntCounterVec::new(
            Opts::new("health_probes_total", "Health probes performed, by outcome")
                .namespace("svalinn"),
            &["service", "outcome"],
        )?;
        registry.register(Box::new(probes_total.clone()))?;

        let status = IntGaugeVec::new(
            Opts::new(
                "health_status",
                "Probed health (0 unknown, 1 healthy, 2 degraded, 3 unhealthy)",
            )
            .namespace("svalinn"),
            &["service"],
        )?;
        registry.register(Box::new(status.clone()))?;

        let latency_seconds = HistogramVec::new(
            HistogramOpts::new("health_probe_latency_seconds", "Probe round-trip latency")
                .namespace("svalinn")
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["service"],
        )?;
        registry.register(Box::new(latency_seconds.clone()))?;

        Ok(Self {
            probes_total,
            status,
            latency_seconds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry_creation() {
        let registry = MetricsRegistry::new().unwrap();
        assert!(registry.registry().gather().len() > 0);
    }

    #[test]
    fn test_admission_metrics() {
        let registry = MetricsRegistry::new().unwrap();

        registry.admission().admissions_total.with_label_values(&["alpaca"]).inc();
        registry.admission().queue_depth.with_label_values(&["alpaca"]).set(3);

        let families = registry.registry().gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "svalinn_rate_limit_admissions_total"));
    }

    #[test]
    fn test_breaker_metrics() {
        let registry = MetricsRegistry::new().unwrap();

        registry.breaker().state.with_label_values(&["broker_api"]).set(1);
        registry
            .breaker()
            .transitions_total
            .with_label_values(&["broker_api", "open"])
            .inc();

        let families = registry.registry().gather();
        assert!(families.iter().any(|f| f.get_name() == "svalinn_circuit_state"));
    }

    #[test]
    fn test_retry_and_fallback_metrics() {
        let registry = MetricsRegistry::new().unwrap();

        registry.retry().attempts_total.inc();
        registry.retry().exhausted_total.inc();
        registry
            .fallback()
            .fallbacks_total
            .with_label_values(&["market_data", "mock_data"])
            .inc();
        registry.fallback().service_level.set(2);

        assert_eq!(registry.retry().attempts_total.get(), 1);
        assert_eq!(registry.fallback().service_level.get(), 2);
    }

    #[test]
    fn test_probe_metrics() {
        let registry = MetricsRegistry::new().unwrap();

        registry.probe().probes_total.with_label_values(&["api", "ok"]).inc();
        registry.probe().status.with_label_values(&["api"]).set(1);
        registry
            .probe()
            .latency_seconds
            .with_label_values(&["api"])
            .observe(0.05);

        let families = registry.registry().gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "svalinn_health_probe_latency_seconds"));
    }

    #[test]
    fn test_cloned_handles_share_families() {
        let registry = MetricsRegistry::new().unwrap();
        let handle = registry.admission().clone();

        handle.admissions_total.with_label_values(&["x"]).inc();
        assert_eq!(
            registry.admission().admissions_total.with_label_values(&["x"]).get(),
            1
        );
    }
}
