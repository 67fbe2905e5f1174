//! Circuit breaker for isolating repeatedly failing upstream services
//!
//! Three-state machine guarding one upstream service: Closed (normal) →
//! Open (fail fast) → HalfOpen (a single trial call probes recovery).
//! While Open, calls are rejected immediately without touching the
//! network. Clones share state, so one breaker can guard a service from
//! many call sites.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ResilienceError, UpstreamError};
use crate::monitoring::{BreakerMetrics, MetricsRegistry};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, calls pass through
    Closed = 0,
    /// Circuit tripped, calls fail fast
    Open = 1,
    /// Waiting on a single trial call to probe recovery
    HalfOpen = 2,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// How long to stay Open before allowing a trial call
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Trips early, probes often (for development upstreams)
    pub fn aggressive() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(10),
        }
    }

    /// Tolerates longer failure runs before isolating (for production)
    pub fn conservative() -> Self {
        Self {
            failure_threshold: 10,
            recovery_timeout: Duration::from_secs(120),
        }
    }
}

/// Mutable breaker state. Kept behind one mutex so the half-open trial
/// slot and the state transitions cannot race each other. The lock is
/// never held across an await.
struct BreakerCore {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Circuit breaker implementation. One instance per upstream service.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    core: Arc<Mutex<BreakerCore>>,
    rejections: Arc<AtomicU64>,
    metrics: Option<BreakerMetrics>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker guarding the named service
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        info!(
            "Creating circuit breaker '{}' with config: {:?}",
            name, config
        );
        Self {
            name,
            config,
            core: Arc::new(Mutex::new(BreakerCore {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_time: None,
                opened_at: None,
                trial_in_flight: false,
            })),
            rejections: Arc::new(AtomicU64::new(0)),
            metrics: None,
        }
    }

    /// Attach Prometheus handles; call once at construction time
    pub fn with_metrics(mut self, registry: &MetricsRegistry) -> Self {
        let metrics = registry.breaker().clone();
        metrics
            .state
            .with_label_values(&[&self.name])
            .set(CircuitState::Closed as i64);
        self.metrics = Some(metrics);
        self
    }

    /// Ask permission to make one call. `Err(CircuitOpen)` means the call
    /// must not be attempted. The returned permit must be resolved with
    /// [`CallPermit::success`] or [`CallPermit::failure`]; dropping it
    /// unresolved releases a half-open trial slot without an outcome.
    pub fn permit(&self) -> Result<CallPermit, ResilienceError> {
        let mut core = self.core.lock();
        match core.state {
            CircuitState::Closed => Ok(self.grant(false)),
            CircuitState::Open => {
                let elapsed = core.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.recovery_timeout {
                    self.transition(&mut core, CircuitState::HalfOpen);
                    core.trial_in_flight = true;
                    Ok(self.grant(true))
                } else {
                    drop(core);
                    Err(self.rejected(self.config.recovery_timeout - elapsed))
                }
            }
            CircuitState::HalfOpen => {
                if core.trial_in_flight {
                    drop(core);
                    Err(self.rejected(Duration::ZERO))
                } else {
                    core.trial_in_flight = true;
                    Ok(self.grant(true))
                }
            }
        }
    }

    /// Run one operation through the breaker, recording its outcome
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let permit = self.permit()?;
        match op().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(err) => {
                permit.failure();
                Err(ResilienceError::Upstream(err))
            }
        }
    }

    fn grant(&self, trial: bool) -> CallPermit {
        CallPermit {
            breaker: self.clone(),
            trial,
            resolved: false,
        }
    }

    fn rejected(&self, retry_in: Duration) -> ResilienceError {
        self.rejections.fetch_add(1, Ordering::Relaxed);
        if let Some(m) = &self.metrics {
            m.rejections_total.with_label_values(&[&self.name]).inc();
        }
        debug!(
            "Circuit breaker '{}' rejecting call (open, next trial in {:?})",
            self.name, retry_in
        );
        ResilienceError::CircuitOpen {
            name: self.name.clone(),
            retry_in,
        }
    }

    fn on_success(&self, trial: bool) {
        let mut core = self.core.lock();
        match core.state {
            CircuitState::Closed => {
                core.failure_count = 0;
            }
            CircuitState::HalfOpen if trial => {
                core.trial_in_flight = false;
                self.transition(&mut core, CircuitState::Closed);
            }
            // Stale outcome from before a state change; nothing to do
            _ => {}
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut core = self.core.lock();
        core.last_failure_time = Some(Instant::now());
        match core.state {
            CircuitState::Closed => {
                core.failure_count = core.failure_count.saturating_add(1);
                if core.failure_count >= self.config.failure_threshold {
                    self.transition(&mut core, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen if trial => {
                core.trial_in_flight = false;
                self.transition(&mut core, CircuitState::Open);
            }
            // Stale outcome or already Open
            _ => {}
        }
    }

    fn release_trial(&self) {
        let mut core = self.core.lock();
        if core.state == CircuitState::HalfOpen {
            debug!(
                "Circuit breaker '{}' trial abandoned without outcome, slot released",
                self.name
            );
            core.trial_in_flight = false;
        }
    }

    /// Transition to a new state. Caller holds the core lock.
    /// `failure_count` survives Closed → Open → HalfOpen → Open cycles so
    /// an open circuit always shows at least `failure_threshold` failures.
    fn transition(&self, core: &mut BreakerCore, to: CircuitState) {
        if core.state == to {
            return;
        }
        core.state = to;
        match to {
            CircuitState::Closed => {
                core.failure_count = 0;
                core.opened_at = None;
                core.trial_in_flight = false;
                info!("Circuit breaker '{}' transitioning to CLOSED", self.name);
            }
            CircuitState::Open => {
                core.opened_at = Some(Instant::now());
                core.trial_in_flight = false;
                warn!(
                    "Circuit breaker '{}' TRIPPED - transitioning to OPEN after {} failures",
                    self.name, core.failure_count
                );
            }
            CircuitState::HalfOpen => {
                debug!(
                    "Circuit breaker '{}' transitioning to HALF-OPEN (testing recovery)",
                    self.name
                );
            }
        }
        if let Some(m) = &self.metrics {
            m.state.with_label_values(&[&self.name]).set(to as i64);
            m.transitions_total
                .with_label_values(&[&self.name, to.as_str()])
                .inc();
        }
    }

    /// Service this breaker guards
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get current state
    pub fn state(&self) -> CircuitState {
        self.core.lock().state
    }

    /// Get consecutive failure count
    pub fn failure_count(&self) -> u32 {
        self.core.lock().failure_count
    }

    /// Time of the most recent recorded failure
    pub fn last_failure_time(&self) -> Option<Instant> {
        self.core.lock().last_failure_time
    }

    /// Calls rejected while Open (or while a trial was in flight)
    pub fn rejection_count(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Reset circuit breaker to Closed state
    pub fn reset(&self) {
        info!("Circuit breaker '{}' manually reset to CLOSED", self.name);
        let mut core = self.core.lock();
        self.transition(&mut core, CircuitState::Closed);
    }

    /// Force circuit breaker to Open state
    pub fn force_open(&self) {
        warn!("Circuit breaker '{}' manually forced to OPEN", self.name);
        let mut core = self.core.lock();
        // Stamp the count so an open circuit never under-reports
        core.failure_count = core.failure_count.max(self.config.failure_threshold);
        self.transition(&mut core, CircuitState::Open);
    }
}

impl Clone for CircuitBreaker {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            config: self.config.clone(),
            core: Arc::clone(&self.core),
            rejections: Arc::clone(&self.rejections),
            metrics: self.metrics.clone(),
        }
    }
}

/// Permission for exactly one call. Resolve with [`success`](Self::success)
/// or [`failure`](Self::failure); dropping without resolving releases a
/// half-open trial slot and leaves the state unchanged.
pub struct CallPermit {
    breaker: CircuitBreaker,
    trial: bool,
    resolved: bool,
}

impl CallPermit {
    /// True when this call is the half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Record a successful outcome
    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.on_success(self.trial);
    }

    /// Record a failed outcome
    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.resolved && self.trial {
            self.breaker.release_trial();
        }
    }
}
