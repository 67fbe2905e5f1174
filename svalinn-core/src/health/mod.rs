//! Upstream reachability monitoring
//!
//! Active health checks against the endpoints the host depends on:
//! - Pluggable probe transport (HTTP by default)
//! - Latency-aware classification into healthy/degraded/unhealthy
//! - Background sweep loop with change observers

pub mod monitor;
pub mod probe;
pub mod status;

pub use monitor::{NetworkMonitor, NetworkMonitorConfig, StatusObserver};
pub use probe::{HealthProbe, HttpProbe, ProbeFuture};
pub use status::{HealthSnapshot, HealthStatus, ServiceHealth};
