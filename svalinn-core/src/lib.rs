//! Svalinn Core - Embedded resilience layer for unreliable upstream services
//!
//! Svalinn sits between a host application and the rate-limited, flaky
//! third-party services it calls (market data vendors, broker APIs,
//! portfolio stores) and keeps the host usable when they are not.
//!
//! ## Components
//! - **Rate limiting**: sliding-window admission with a priority queue
//!   and provider-throttle cooldowns
//! - **Circuit breaking**: fail fast against dead services, probe
//!   recovery with a single trial call
//! - **Retries**: exponential backoff with jitter, escalated per service
//!   from observed error rates
//! - **Degradation**: cached, mocked, reduced, skipped, or manual results
//!   when the real thing is unavailable
//! - **Health monitoring**: active probing with latency-aware
//!   classification
//!
//! Components compose but do not require each other; a host can adopt a
//! single `RateLimiter` or wire the full stack. All of them are cheap to
//! clone and share their state across tasks.
//!
//! ## Core Modules
//! - `limiter`: sliding-window admission control
//! - `breaker`: three-state circuit breaker
//! - `retry`: backoff schedule and retry engine
//! - `adaptive`: per-service retry profiles and breakers
//! - `degrade`: fallback strategies and derived service level
//! - `health`: endpoint probing and reachability
//! - `monitoring`: Prometheus metrics and scrape server
//! - `testing`: deterministic fakes for tests and examples

pub mod adaptive;
pub mod breaker;
pub mod degrade;
pub mod error;
pub mod health;
pub mod limiter;
pub mod monitoring;
pub mod retry;
pub mod testing;
pub mod utils;

pub use adaptive::{ServiceCallStats, SmartRetryPolicy};
pub use breaker::{CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use degrade::{
    CallOptions, Criticality, DegradationManager, DegradationManagerConfig, FallbackStrategy,
    ServiceDependency, ServiceLevel, ServiceResult,
};
pub use error::{ResilienceError, UpstreamError};
pub use health::{HealthStatus, NetworkMonitor, NetworkMonitorConfig};
pub use limiter::{RateLimiter, RateLimiterConfig};
pub use monitoring::{MetricsRegistry, MetricsServer, MetricsServerConfig};
pub use retry::{RetryConfig, RetryEngine, RetryObserver};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::adaptive::SmartRetryPolicy;
    pub use crate::breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
    pub use crate::degrade::{
        CallOptions, Criticality, DegradationManager, FallbackStrategy, ServiceDependency,
        ServiceLevel,
    };
    pub use crate::error::{ResilienceError, UpstreamError};
    pub use crate::health::{HealthStatus, NetworkMonitor, NetworkMonitorConfig};
    pub use crate::limiter::{RateLimiter, RateLimiterConfig};
    pub use crate::monitoring::MetricsRegistry;
    pub use crate::retry::{RetryConfig, RetryEngine};
}
