//! Monitoring and observability module
//!
//! Prometheus metric families for every resilience component, plus a
//! small HTTP server exposing them for scraping.

pub mod metrics;
pub mod server;

pub use metrics::{
    AdmissionMetrics, BreakerMetrics, FallbackMetrics, MetricsRegistry, ProbeMetrics, RetryMetrics,
};
pub use server::{MetricsServer, MetricsServerConfig};
