//! Graceful degradation orchestration
//!
//! The `DegradationManager` wraps calls to registered upstream services and
//! turns hard failures into degraded-but-usable results:
//!
//! - Successful payloads are cached per call identity
//! - A fresh cache hit short-circuits the upstream call entirely
//! - On failure the dependency's fallback strategy decides what to serve
//! - Availability bookkeeping derives a process-wide service level
//!
//! Results produced by a fallback are never written back to the cache, so a
//! mock payload can never masquerade as real upstream data later.
//!
//! ```no_run
//! use svalinn_core::degrade::{CallOptions, DegradationManager};
//!
//! async fn quote(manager: &DegradationManager) -> anyhow::Result<()> {
//!     let result = manager
//!         .execute_with_fallback("market_data", "quote", "AAPL", CallOptions::default(), || async {
//!             Ok::<_, std::io::Error>(serde_json::json!({"price": 187.2}))
//!         })
//!         .await?;
//!     println!("{} (degraded: {})", result.value, result.degraded);
//!     Ok(())
//! }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::degrade::cache::{CacheKey, ResultCache};
use crate::degrade::dependency::{
    Criticality, FallbackStrategy, ServiceDependency, ServiceLevel,
};
use crate::error::ResilienceError;
use crate::monitoring::{FallbackMetrics, MetricsRegistry};

/// Handler invoked by the mock_data strategy, receiving the failed
/// call's operation and arguments
pub type MockHandler = Arc<dyn Fn(&str, &str) -> Value + Send + Sync>;

/// Per-call knobs for `execute_with_fallback`
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Serve a fresh cache hit instead of calling upstream
    pub use_cache: bool,
    /// Maximum age for a cache hit to count as fresh
    pub cache_ttl: Duration,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            cache_ttl: Duration::from_secs(300),
        }
    }
}

impl CallOptions {
    /// Always call upstream, even when a fresh cached value exists
    pub fn bypass_cache() -> Self {
        Self {
            use_cache: false,
            ..Self::default()
        }
    }
}

/// Where a served value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    /// Live upstream response
    Upstream,
    /// Fresh cache hit
    Cache,
    /// Stale cache entry served by the cache_only strategy
    StaleCache,
    /// Synthesized by the named fallback strategy
    Fallback(FallbackStrategy),
}

/// Outcome of one guarded call
#[derive(Debug, Clone, Serialize)]
pub struct ServiceResult {
    pub value: Value,
    pub source: ResultSource,
    /// True whenever the value did not come from a live or fresh source
    pub degraded: bool,
}

/// Operator-facing summary of the current degradation posture
#[derive(Debug, Clone, Serialize)]
pub struct DegradationInfo {
    pub level: ServiceLevel,
    pub unavailable_services: Vec<String>,
    pub capabilities: Vec<&'static str>,
    pub recommendations: Vec<&'static str>,
}

#[derive(Debug, Clone)]
pub struct DegradationManagerConfig {
    /// Upper bound on cached call results
    pub cache_max_entries: usize,
}

impl Default for DegradationManagerConfig {
    fn default() -> Self {
        Self {
            cache_max_entries: 1024,
        }
    }
}

/// Tracks upstream availability and serves fallbacks for failed calls.
///
/// Shared between tasks behind an `Arc`; all methods take `&self`.
pub struct DegradationManager {
    dependencies: RwLock<BTreeMap<String, ServiceDependency>>,
    handlers: RwLock<HashMap<String, MockHandler>>,
    cache: Mutex<ResultCache>,
    level: Mutex<ServiceLevel>,
    metrics: Option<FallbackMetrics>,
}

impl DegradationManager {
    pub fn new(config: DegradationManagerConfig) -> Self {
        Self {
            dependencies: RwLock::new(BTreeMap::new()),
            handlers: RwLock::new(HashMap::new()),
            cache: Mutex::new(ResultCache::new(config.cache_max_entries)),
            level: Mutex::new(ServiceLevel::Full),
            metrics: None,
        }
    }

    /// Attach Prometheus instrumentation
    pub fn with_metrics(mut self, registry: &MetricsRegistry) -> Self {
        let metrics = registry.fallback().clone();
        metrics.service_level.set(ServiceLevel::Full as i64);
        self.metrics = Some(metrics);
        self
    }

    /// Register (or replace) a dependency
    pub fn register_dependency(&self, dependency: ServiceDependency) {
        info!(
            "Registered dependency '{}' ({:?}, fallback: {})",
            dependency.name, dependency.criticality, dependency.fallback_strategy
        );
        self.dependencies
            .write()
            .insert(dependency.name.clone(), dependency);
        self.reassess_level();
    }

    /// Register the dependency set a trading host starts from
    pub fn register_standard_dependencies(&self) {
        self.register_dependency(ServiceDependency::new(
            "market_data",
            Criticality::Critical,
            FallbackStrategy::MockData,
        ));
        self.register_dependency(ServiceDependency::new(
            "broker_api",
            Criticality::Important,
            FallbackStrategy::ManualMode,
        ));
        self.register_dependency(ServiceDependency::new(
            "portfolio_store",
            Criticality::Important,
            FallbackStrategy::CacheOnly,
        ));
        self.register_dependency(ServiceDependency::new(
            "news_feed",
            Criticality::Optional,
            FallbackStrategy::SkipFeature,
        ));
    }

    /// Install a handler the mock_data strategy calls for this service
    pub fn register_mock_handler(&self, service: &str, handler: MockHandler) {
        self.handlers.write().insert(service.to_string(), handler);
    }

    /// Run `work`, serving cache hits before it and fallbacks after it fails.
    ///
    /// `args` disambiguates calls to the same operation (symbol, account id,
    /// query string). Errors only surface as `NoFallback` when the strategy
    /// has nothing to serve.
    pub async fn execute_with_fallback<F, Fut, E>(
        &self,
        service: &str,
        operation: &str,
        args: &str,
        options: CallOptions,
        work: F,
    ) -> Result<ServiceResult, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let key = CacheKey::new(service, operation, args);

        if options.use_cache {
            let hit = self.cache.lock().fresh(&key, options.cache_ttl);
            if let Some(value) = hit {
                debug!("Serving {} from cache", key);
                if let Some(metrics) = &self.metrics {
                    metrics.cache_hits_total.with_label_values(&[service]).inc();
                }
                return Ok(ServiceResult {
                    value,
                    source: ResultSource::Cache,
                    degraded: false,
                });
            }
        }

        match work().await {
            Ok(value) => {
                self.cache.lock().put(key, value.clone());
                self.mark_service_up(service);
                Ok(ServiceResult {
                    value,
                    source: ResultSource::Upstream,
                    degraded: false,
                })
            }
            Err(err) => {
                warn!("Call {} failed: {} - applying fallback", key, err);
                self.mark_service_down(service);
                self.apply_fallback(service, &key, Box::new(err))
            }
        }
    }

    fn apply_fallback(
        &self,
        service: &str,
        key: &CacheKey,
        err: Box<dyn std::error::Error + Send + Sync>,
    ) -> Result<ServiceResult, ResilienceError> {
        let (strategy, static_data) = {
            let deps = self.dependencies.read();
            match deps.get(service) {
                Some(dep) => (dep.fallback_strategy, dep.fallback_data.clone()),
                None => {
                    warn!(
                        "No dependency registered for '{}' - defaulting to mock data",
                        service
                    );
                    (FallbackStrategy::MockData, None)
                }
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics
                .fallbacks_total
                .with_label_values(&[service, strategy.as_str()])
                .inc();
        }

        let fallback = |value| {
            Ok(ServiceResult {
                value,
                source: ResultSource::Fallback(strategy),
                degraded: true,
            })
        };

        match strategy {
            FallbackStrategy::CacheOnly => match self.cache.lock().any(key) {
                Some((value, age)) => {
                    info!("Serving stale cache for {} (age {:?})", key, age);
                    Ok(ServiceResult {
                        value,
                        source: ResultSource::StaleCache,
                        degraded: true,
                    })
                }
                None => Err(ResilienceError::NoFallback {
                    service: service.to_string(),
                    operation: key.operation.clone(),
                    source: err,
                }),
            },
            FallbackStrategy::MockData => {
                let handler = self.handlers.read().get(service).cloned();
                let value = match handler {
                    Some(handler) => handler(&key.operation, &key.args),
                    None => static_data
                        .unwrap_or_else(|| json!({"status": "mock", "service": service})),
                };
                fallback(value)
            }
            FallbackStrategy::ReducedScope => {
                fallback(json!({"status": "degraded", "service": service, "data": []}))
            }
            FallbackStrategy::SkipFeature => fallback(Value::Null),
            FallbackStrategy::ManualMode => {
                fallback(json!({"status": "manual_intervention_required", "service": service}))
            }
        }
    }

    /// Record a successful interaction with a service
    pub fn mark_service_up(&self, service: &str) {
        {
            let mut deps = self.dependencies.write();
            match deps.get_mut(service) {
                Some(dep) => {
                    if !dep.is_available {
                        info!("Service '{}' recovered", service);
                    }
                    dep.is_available = true;
                }
                None => return,
            }
        }
        self.reassess_level();
    }

    /// Record a failed interaction with a service
    pub fn mark_service_down(&self, service: &str) {
        {
            let mut deps = self.dependencies.write();
            match deps.get_mut(service) {
                Some(dep) => {
                    if dep.is_available {
                        warn!("Service '{}' marked DOWN", service);
                    }
                    dep.is_available = false;
                    dep.failure_count += 1;
                    dep.last_failure = Some(SystemTime::now());
                }
                None => {
                    debug!("Ignoring failure report for unregistered '{}'", service);
                    return;
                }
            }
        }
        self.reassess_level();
    }

    pub fn is_available(&self, service: &str) -> bool {
        self.dependencies
            .read()
            .get(service)
            .map(|dep| dep.is_available)
            .unwrap_or(false)
    }

    pub fn current_level(&self) -> ServiceLevel {
        *self.level.lock()
    }

    /// Posture summary for dashboards and operator tooling
    pub fn get_degradation_info(&self) -> DegradationInfo {
        let unavailable_services: Vec<String> = {
            let deps = self.dependencies.read();
            deps.values()
                .filter(|dep| !dep.is_available)
                .map(|dep| dep.name.clone())
                .collect()
        };
        let level = self.current_level();
        let (capabilities, recommendations) = level_guidance(level);
        DegradationInfo {
            level,
            unavailable_services,
            capabilities,
            recommendations,
        }
    }

    /// Snapshot of every registered dependency, keyed by name
    pub fn get_service_status(&self) -> BTreeMap<String, ServiceDependency> {
        self.dependencies.read().clone()
    }

    /// (current entries, capacity) of the result cache
    pub fn cache_usage(&self) -> (usize, usize) {
        let cache = self.cache.lock();
        (cache.len(), cache.max_entries())
    }

    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    fn reassess_level(&self) {
        let new_level = {
            let deps = self.dependencies.read();
            derive_level(deps.values())
        };
        let mut level = self.level.lock();
        if *level == new_level {
            return;
        }
        if new_level > *level {
            warn!("Service level degraded: {} -> {}", *level, new_level);
        } else {
            info!("Service level recovered: {} -> {}", *level, new_level);
        }
        *level = new_level;
        if let Some(metrics) = &self.metrics {
            metrics.service_level.set(new_level as i64);
        }
    }
}

impl Default for DegradationManager {
    fn default() -> Self {
        Self::new(DegradationManagerConfig::default())
    }
}

/// Classify overall availability from the registered dependency set
fn derive_level<'a>(deps: impl Iterator<Item = &'a ServiceDependency>) -> ServiceLevel {
    let mut critical_down = 0u32;
    let mut important_down = 0u32;
    for dep in deps {
        if dep.is_available {
            continue;
        }
        match dep.criticality {
            Criticality::Critical => critical_down += 1,
            Criticality::Important => important_down += 1,
            Criticality::Optional => {}
        }
    }
    if critical_down > 1 {
        ServiceLevel::Offline
    } else if critical_down == 1 {
        ServiceLevel::Minimal
    } else if important_down > 0 {
        ServiceLevel::Degraded
    } else {
        ServiceLevel::Full
    }
}

fn level_guidance(level: ServiceLevel) -> (Vec<&'static str>, Vec<&'static str>) {
    match level {
        ServiceLevel::Full => (
            vec![
                "live market data",
                "order execution",
                "portfolio analytics",
                "news enrichment",
            ],
            vec![],
        ),
        ServiceLevel::Degraded => (
            vec!["live market data", "order execution"],
            vec![
                "some features are running on fallbacks",
                "review unavailable services before relying on analytics",
            ],
        ),
        ServiceLevel::Minimal => (
            vec!["cached market data", "manual order entry"],
            vec![
                "avoid automated trading until the data provider recovers",
                "verify positions against broker statements",
            ],
        ),
        ServiceLevel::Offline => (
            vec![],
            vec![
                "do not trade",
                "escalate to the operations channel",
                "wait for critical providers to recover",
            ],
        ),
    }
}
