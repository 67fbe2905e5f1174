//! Retry engine with exponential backoff and jitter
//!
//! Re-executes failed upstream calls with exponentially growing delays.
//! Only transient errors are retried (transport failures, timeouts, 429
//! and 5xx statuses); deterministic caller mistakes surface immediately.
//! Attempts can be routed through a circuit breaker, in which case an
//! open circuit abandons the remaining budget at once.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::breaker::CircuitBreaker;
use crate::error::{ResilienceError, UpstreamError};
use crate::monitoring::{MetricsRegistry, RetryMetrics};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the initial attempt (total attempts = max_retries + 1)
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Ceiling on the computed delay, applied before jitter
    pub max_delay: Duration,
    /// Growth factor per retry (typically 2.0)
    pub exponential_base: f64,
    /// Scale each delay by a random factor in [0.5, 1.5]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// For upstreams showing elevated error rates
    pub fn moderate() -> Self {
        Self {
            max_retries: 4,
            initial_delay: Duration::from_millis(1500),
            ..Default::default()
        }
    }

    /// For upstreams currently failing more often than succeeding
    pub fn aggressive() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(2),
            ..Default::default()
        }
    }

    /// Delay before retry `attempt` (0-indexed), without jitter:
    /// `min(initial_delay * base^attempt, max_delay)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let grown = self.initial_delay.as_secs_f64() * self.exponential_base.powi(attempt as i32);
        Duration::from_secs_f64(grown.min(self.max_delay.as_secs_f64()))
    }

    fn jittered(&self, base: Duration) -> Duration {
        if !self.jitter {
            return base;
        }
        let factor = rand::thread_rng().gen_range(0.5..=1.5);
        Duration::from_secs_f64(base.as_secs_f64() * factor)
    }
}

/// Hook invoked before each retry delay. Subscribers run synchronously on
/// the calling task in registration order; they observe, they cannot veto,
/// and they must return quickly.
pub trait RetryObserver: Send + Sync {
    /// `attempt` is the 0-indexed attempt that just failed
    fn on_retry(&self, attempt: u32, error: &UpstreamError);
}

/// Retry engine. Cheap to clone; clones share observers.
#[derive(Clone)]
pub struct RetryEngine {
    config: RetryConfig,
    observers: Vec<Arc<dyn RetryObserver>>,
    metrics: Option<RetryMetrics>,
}

impl RetryEngine {
    /// Create a new retry engine
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            observers: Vec::new(),
            metrics: None,
        }
    }

    /// Subscribe an observer; call at construction time
    pub fn with_observer(mut self, observer: Arc<dyn RetryObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Attach Prometheus handles; call once at construction time
    pub fn with_metrics(mut self, registry: &MetricsRegistry) -> Self {
        self.metrics = Some(registry.retry().clone());
        self
    }

    /// Get the configuration
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Execute an operation, retrying transient failures up to the budget.
    /// Exhaustion wraps the last error as `RetriesExhausted`.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        self.run(op, None).await
    }

    /// Execute with every attempt routed through the breaker. An open
    /// circuit surfaces immediately; the remaining budget is abandoned.
    pub async fn execute_with_breaker<T, F, Fut>(
        &self,
        op: F,
        breaker: &CircuitBreaker,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        self.run(op, Some(breaker)).await
    }

    async fn run<T, F, Fut>(
        &self,
        mut op: F,
        breaker: Option<&CircuitBreaker>,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let attempts = self.config.max_retries + 1;
        let mut attempt = 0u32;
        loop {
            let permit = match breaker {
                Some(cb) => Some(cb.permit()?),
                None => None,
            };

            if let Some(m) = &self.metrics {
                m.attempts_total.inc();
            }

            match op().await {
                Ok(value) => {
                    if let Some(p) = permit {
                        p.success();
                    }
                    if attempt > 0 {
                        debug!("Call succeeded on attempt {}/{}", attempt + 1, attempts);
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if let Some(p) = permit {
                        p.failure();
                    }
                    if !err.is_retryable() {
                        debug!("Not retrying non-transient error: {}", err);
                        return Err(ResilienceError::Upstream(err));
                    }
                    if attempt + 1 >= attempts {
                        warn!("Retries exhausted after {} attempts: {}", attempts, err);
                        if let Some(m) = &self.metrics {
                            m.exhausted_total.inc();
                        }
                        return Err(ResilienceError::RetriesExhausted {
                            attempts,
                            source: err,
                        });
                    }

                    let delay = self.config.jittered(self.config.delay_for(attempt));
                    warn!(
                        "Attempt {}/{} failed: {} - retrying in {:?}",
                        attempt + 1,
                        attempts,
                        err,
                        delay
                    );
                    for observer in &self.observers {
                        observer.on_retry(attempt, &err);
                    }
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryEngine {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreakerConfig;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_doubles_and_caps() {
        let config = RetryConfig::default();

        assert_eq!(config.delay_for(0), Duration::from_secs(1));
        assert_eq!(config.delay_for(1), Duration::from_secs(2));
        assert_eq!(config.delay_for(2), Duration::from_secs(4));
        assert_eq!(config.delay_for(3), Duration::from_secs(8));

        // Capped at max_delay from the 6th retry onwards
        assert_eq!(config.delay_for(6), Duration::from_secs(60));
        assert_eq!(config.delay_for(20), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_bounds() {
        let config = RetryConfig::default();
        let base = Duration::from_secs(2);

        for _ in 0..100 {
            let jittered = config.jittered(base);
            assert!(jittered >= Duration::from_secs(1));
            assert!(jittered <= Duration::from_secs(3));
        }
    }

    #[test]
    fn test_jitter_varies() {
        let config = RetryConfig::default();
        let base = Duration::from_secs(10);

        let a = config.jittered(base);
        let b = config.jittered(base);
        let c = config.jittered(base);
        assert!(
            !(a == b && b == c),
            "jitter should produce varying delays"
        );
    }

    #[test]
    fn test_jitter_disabled_is_exact() {
        let config = RetryConfig {
            jitter: false,
            ..Default::default()
        };
        assert_eq!(config.jittered(Duration::from_secs(4)), Duration::from_secs(4));
    }

    #[test]
    fn test_config_profiles() {
        let config = RetryConfig::moderate();
        assert_eq!(config.max_retries, 4);
        assert_eq!(config.initial_delay, Duration::from_millis(1500));

        let config = RetryConfig::aggressive();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.initial_delay, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_execute_success_first_try() {
        let engine = RetryEngine::default();
        let calls = AtomicU32::new(0);

        let out = engine
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, UpstreamError>(42) }
            })
            .await;

        assert_eq!(out.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_retries_transient_errors() {
        let engine = RetryEngine::new(RetryConfig::default());
        let calls = AtomicU32::new(0);

        let out = engine
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(UpstreamError::Status { status: 503 })
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(out.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_execute_non_retryable_surfaces_immediately() {
        let engine = RetryEngine::default();
        let calls = AtomicU32::new(0);

        let out: Result<(), _> = engine
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(UpstreamError::Status { status: 404 }) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match out {
            Err(ResilienceError::Upstream(UpstreamError::Status { status })) => {
                assert_eq!(status, 404)
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_exhaustion_wraps_last_error() {
        let engine = RetryEngine::new(RetryConfig {
            max_retries: 2,
            ..Default::default()
        });
        let calls = AtomicU32::new(0);

        let out: Result<(), _> = engine
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(UpstreamError::transport("connection reset")) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match out {
            Err(ResilienceError::RetriesExhausted { attempts, source }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(source, UpstreamError::Transport { .. }));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_abandons_budget() {
        let engine = RetryEngine::new(RetryConfig::default());
        let breaker = CircuitBreaker::new(
            "flaky",
            CircuitBreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_secs(60),
            },
        );
        let calls = AtomicU32::new(0);

        // First attempt fails and trips the breaker; the engine then sees
        // an open circuit and gives up without burning the retry budget.
        let out: Result<(), _> = engine
            .execute_with_breaker(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(UpstreamError::Status { status: 500 }) }
                },
                &breaker,
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(out, Err(ResilienceError::CircuitOpen { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_observers_called_in_order() {
        struct Recorder {
            id: &'static str,
            log: Arc<Mutex<Vec<(&'static str, u32)>>>,
        }
        impl RetryObserver for Recorder {
            fn on_retry(&self, attempt: u32, _error: &UpstreamError) {
                self.log.lock().push((self.id, attempt));
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let engine = RetryEngine::new(RetryConfig {
            max_retries: 1,
            ..Default::default()
        })
        .with_observer(Arc::new(Recorder {
            id: "first",
            log: log.clone(),
        }))
        .with_observer(Arc::new(Recorder {
            id: "second",
            log: log.clone(),
        }));

        let _: Result<(), _> = engine
            .execute(|| async { Err(UpstreamError::Status { status: 502 }) })
            .await;

        assert_eq!(*log.lock(), vec![("first", 0), ("second", 0)]);
    }
}
