//! Per-service health bookkeeping

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Latency samples kept per service for the rolling average
const LATENCY_WINDOW: usize = 100;

/// Probe-derived classification of one service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Responding normally
    Healthy,
    /// Responding, but slowly or after recent failures
    Degraded,
    /// Repeated failures; treat as down
    Unhealthy,
    /// Not probed yet
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rolling health record for one monitored endpoint
#[derive(Debug, Clone)]
pub struct ServiceHealth {
    pub name: String,
    pub url: String,
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub last_check: Option<Instant>,
    pub last_latency: Option<Duration>,
    pub checks_total: u64,
    pub failures_total: u64,
    latencies: VecDeque<Duration>,
}

impl ServiceHealth {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            status: HealthStatus::Unknown,
            consecutive_failures: 0,
            last_check: None,
            last_latency: None,
            checks_total: 0,
            failures_total: 0,
            latencies: VecDeque::with_capacity(LATENCY_WINDOW),
        }
    }

    /// Record a completed probe with its response latency
    pub fn record_success(&mut self, latency: Duration) {
        self.checks_total += 1;
        self.consecutive_failures = 0;
        self.last_check = Some(Instant::now());
        self.last_latency = Some(latency);
        if self.latencies.len() == LATENCY_WINDOW {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
    }

    /// Record a probe that produced no usable response
    pub fn record_failure(&mut self) {
        self.checks_total += 1;
        self.failures_total += 1;
        self.consecutive_failures += 1;
        self.last_check = Some(Instant::now());
        self.last_latency = None;
    }

    /// Mean latency over the sample window
    pub fn average_latency(&self) -> Option<Duration> {
        if self.latencies.is_empty() {
            return None;
        }
        let total: Duration = self.latencies.iter().sum();
        Some(total / self.latencies.len() as u32)
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            name: self.name.clone(),
            url: self.url.clone(),
            status: self.status,
            consecutive_failures: self.consecutive_failures,
            last_latency_ms: self.last_latency.map(|d| d.as_millis() as u64),
            average_latency_ms: self.average_latency().map(|d| d.as_millis() as u64),
            last_check_age_secs: self.last_check.map(|at| at.elapsed().as_secs()),
            checks_total: self.checks_total,
            failures_total: self.failures_total,
        }
    }
}

/// Serializable point-in-time view of one service's health
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub name: String,
    pub url: String,
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub last_latency_ms: Option<u64>,
    pub average_latency_ms: Option<u64>,
    pub last_check_age_secs: Option<u64>,
    pub checks_total: u64,
    pub failures_total: u64,
}
