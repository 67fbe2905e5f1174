//! Active endpoint monitoring
//!
//! Probes registered endpoints and classifies each one:
//! - Any status below 500 within the timeout counts as a response
//! - A slow response (at or above the degraded latency) marks the
//!   service degraded even though it answered
//! - Repeated failures escalate from degraded to unhealthy
//!
//! Checks can be driven manually (`check_all_services`) or by the
//! background loop (`start_monitoring`). Observers are notified once per
//! sweep that changed at least one status.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::health::probe::{HealthProbe, HttpProbe};
use crate::health::status::{HealthSnapshot, HealthStatus, ServiceHealth};
use crate::monitoring::{MetricsRegistry, ProbeMetrics};

/// Called after any sweep that changed at least one service's status.
/// Runs on the sweeping task, so implementations should be quick.
pub trait StatusObserver: Send + Sync {
    fn on_status_change(&self, snapshot: &[HealthSnapshot]);
}

#[derive(Debug, Clone)]
pub struct NetworkMonitorConfig {
    /// Probe attempts that outlive this count as failures
    pub probe_timeout: Duration,
    /// Responses at or above this latency mark the service degraded
    pub degraded_latency: Duration,
    /// Consecutive failures before a service is unhealthy
    pub unhealthy_after: u32,
    /// Background sweep period
    pub check_interval: Duration,
    /// Poll period used by `wait_for_service`
    pub wait_poll_interval: Duration,
}

impl Default for NetworkMonitorConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(10),
            degraded_latency: Duration::from_secs(5),
            unhealthy_after: 3,
            check_interval: Duration::from_secs(30),
            wait_poll_interval: Duration::from_secs(5),
        }
    }
}

struct MonitorInner {
    config: NetworkMonitorConfig,
    probe: Arc<dyn HealthProbe>,
    targets: RwLock<BTreeMap<String, ServiceHealth>>,
    observers: RwLock<Vec<Arc<dyn StatusObserver>>>,
    stop: Notify,
    running: AtomicBool,
}

/// Watches upstream endpoints and answers "can I reach this service".
///
/// Cheap to clone; clones share targets, observers, and the loop flag.
#[derive(Clone)]
pub struct NetworkMonitor {
    inner: Arc<MonitorInner>,
    metrics: Option<ProbeMetrics>,
}

impl NetworkMonitor {
    /// Monitor probing over HTTP with the config's timeout
    pub fn new(config: NetworkMonitorConfig) -> Result<Self, reqwest::Error> {
        let probe = HttpProbe::new(config.probe_timeout)?;
        Ok(Self::with_probe(config, Arc::new(probe)))
    }

    /// Monitor with a caller-supplied transport
    pub fn with_probe(config: NetworkMonitorConfig, probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                config,
                probe,
                targets: RwLock::new(BTreeMap::new()),
                observers: RwLock::new(Vec::new()),
                stop: Notify::new(),
                running: AtomicBool::new(false),
            }),
            metrics: None,
        }
    }

    /// Attach Prometheus instrumentation
    pub fn with_metrics(mut self, registry: &MetricsRegistry) -> Self {
        self.metrics = Some(registry.probe().clone());
        self
    }

    /// Start (or replace) tracking of one endpoint
    pub fn register_target(&self, name: &str, url: &str) {
        debug!("Monitoring '{}' at {}", name, url);
        self.inner
            .targets
            .write()
            .insert(name.to_string(), ServiceHealth::new(name, url));
    }

    pub fn add_observer(&self, observer: Arc<dyn StatusObserver>) {
        self.inner.observers.write().push(observer);
    }

    /// Probe one service now and return its resulting status
    pub async fn check_service(&self, name: &str) -> Option<HealthStatus> {
        let url = {
            let targets = self.inner.targets.read();
            targets.get(name)?.url.clone()
        };
        let outcome = self.probe_url(name, &url).await;

        let mut targets = self.inner.targets.write();
        let health = targets.get_mut(name)?;
        Some(self.apply_outcome(health, outcome))
    }

    /// Probe every registered service concurrently. Returns how many
    /// services changed status; observers fire when that is non-zero.
    pub async fn check_all_services(&self) -> usize {
        let targets: Vec<(String, String)> = {
            let targets = self.inner.targets.read();
            targets
                .iter()
                .map(|(name, health)| (name.clone(), health.url.clone()))
                .collect()
        };
        if targets.is_empty() {
            return 0;
        }

        let mut probes = JoinSet::new();
        for (name, url) in targets {
            let monitor = self.clone();
            probes.spawn(async move {
                let outcome = monitor.probe_url(&name, &url).await;
                (name, outcome)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = probes.join_next().await {
            if let Ok(outcome) = joined {
                outcomes.push(outcome);
            }
        }

        let mut changed = 0;
        {
            let mut targets = self.inner.targets.write();
            for (name, outcome) in outcomes {
                if let Some(health) = targets.get_mut(&name) {
                    let before = health.status;
                    let after = self.apply_outcome(health, outcome);
                    if before != after {
                        changed += 1;
                    }
                }
            }
        }

        if changed > 0 {
            self.notify_observers();
        }
        changed
    }

    /// Healthy and degraded services both count as reachable
    pub fn is_service_available(&self, name: &str) -> bool {
        matches!(
            self.status_of(name),
            Some(HealthStatus::Healthy) | Some(HealthStatus::Degraded)
        )
    }

    pub fn status_of(&self, name: &str) -> Option<HealthStatus> {
        self.inner
            .targets
            .read()
            .get(name)
            .map(|health| health.status)
    }

    /// Point-in-time view of every target, sorted by name
    pub fn snapshot(&self) -> Vec<HealthSnapshot> {
        self.inner
            .targets
            .read()
            .values()
            .map(ServiceHealth::snapshot)
            .collect()
    }

    /// Actively re-probe a service until it is reachable or the deadline
    /// passes. Returns whether the service came up in time.
    pub async fn wait_for_service(&self, name: &str, deadline: Duration) -> bool {
        let deadline_at = Instant::now() + deadline;
        loop {
            if matches!(
                self.check_service(name).await,
                Some(HealthStatus::Healthy) | Some(HealthStatus::Degraded)
            ) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline_at {
                warn!("Gave up waiting for '{}' after {:?}", name, deadline);
                return false;
            }
            let sleep_for = self.inner.config.wait_poll_interval.min(deadline_at - now);
            tokio::time::sleep(sleep_for).await;
        }
    }

    /// Spawn the periodic sweep loop. The first sweep runs immediately.
    /// No-op when the loop is already running.
    pub fn start_monitoring(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            debug!("Monitor loop already running");
            return;
        }
        let monitor = self.clone();
        tokio::spawn(async move {
            info!(
                "Network monitor started (interval {:?})",
                monitor.inner.config.check_interval
            );
            let mut ticker = interval(monitor.inner.config.check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        monitor.check_all_services().await;
                    }
                    _ = monitor.inner.stop.notified() => break,
                }
            }
            monitor.inner.running.store(false, Ordering::SeqCst);
            info!("Network monitor stopped");
        });
    }

    /// Ask the sweep loop to exit after its current pass
    pub fn stop_monitoring(&self) {
        self.inner.stop.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    async fn probe_url(&self, name: &str, url: &str) -> Result<(u16, Duration), String> {
        let started = Instant::now();
        let result = timeout(self.inner.config.probe_timeout, self.inner.probe.probe(url)).await;
        match result {
            Ok(Ok(status)) => Ok((status, started.elapsed())),
            Ok(Err(message)) => Err(message),
            Err(_) => Err(format!(
                "no response from '{}' within {:?}",
                name, self.inner.config.probe_timeout
            )),
        }
    }

    /// Fold one probe outcome into the service record and return the new
    /// status. Caller holds the targets write lock.
    fn apply_outcome(
        &self,
        health: &mut ServiceHealth,
        outcome: Result<(u16, Duration), String>,
    ) -> HealthStatus {
        let config = &self.inner.config;
        let new_status = match outcome {
            // Client errors still prove the endpoint is up and answering
            Ok((status, latency)) if status < 500 => {
                health.record_success(latency);
                if let Some(metrics) = &self.metrics {
                    metrics
                        .probes_total
                        .with_label_values(&[&health.name, "ok"])
                        .inc();
                    metrics
                        .latency_seconds
                        .with_label_values(&[&health.name])
                        .observe(latency.as_secs_f64());
                }
                if latency >= config.degraded_latency {
                    warn!(
                        "Service '{}' responded in {:?} (degraded threshold {:?})",
                        health.name, latency, config.degraded_latency
                    );
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                }
            }
            Ok((status, _)) => {
                warn!("Probe for '{}' returned HTTP {}", health.name, status);
                self.record_probe_failure(health, config.unhealthy_after)
            }
            Err(message) => {
                warn!("Probe for '{}' failed: {}", health.name, message);
                self.record_probe_failure(health, config.unhealthy_after)
            }
        };

        if health.status != new_status {
            info!(
                "Service '{}' health changed: {} -> {}",
                health.name, health.status, new_status
            );
        }
        health.status = new_status;
        if let Some(metrics) = &self.metrics {
            metrics
                .status
                .with_label_values(&[&health.name])
                .set(status_gauge(new_status));
        }
        new_status
    }

    fn record_probe_failure(&self, health: &mut ServiceHealth, unhealthy_after: u32) -> HealthStatus {
        health.record_failure();
        if let Some(metrics) = &self.metrics {
            metrics
                .probes_total
                .with_label_values(&[&health.name, "fail"])
                .inc();
        }
        if health.consecutive_failures >= unhealthy_after {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        }
    }

    fn notify_observers(&self) {
        let snapshot = self.snapshot();
        let observers: Vec<Arc<dyn StatusObserver>> = self.inner.observers.read().clone();
        for observer in observers {
            observer.on_status_change(&snapshot);
        }
    }
}

fn status_gauge(status: HealthStatus) -> i64 {
    match status {
        HealthStatus::Unknown => 0,
        HealthStatus::Healthy => 1,
        HealthStatus::Degraded => 2,
        HealthStatus::Unhealthy => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::probe::ProbeFuture;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    /// Plays back a fixed list of probe outcomes, optionally after a delay
    struct SequenceProbe {
        responses: Mutex<VecDeque<Result<u16, String>>>,
        delay: Option<Duration>,
    }

    impl SequenceProbe {
        fn new(responses: Vec<Result<u16, String>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                delay: None,
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }
    }

    impl HealthProbe for SequenceProbe {
        fn probe<'a>(&'a self, _url: &'a str) -> ProbeFuture<'a> {
            Box::pin(async move {
                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
                self.responses.lock().pop_front().unwrap_or(Ok(200))
            })
        }
    }

    fn monitor_with(probe: SequenceProbe) -> NetworkMonitor {
        let monitor =
            NetworkMonitor::with_probe(NetworkMonitorConfig::default(), Arc::new(probe));
        monitor.register_target("api", "http://localhost:9/health");
        monitor
    }

    #[tokio::test]
    async fn test_unknown_until_first_probe() {
        let monitor = monitor_with(SequenceProbe::new(vec![]));
        assert_eq!(monitor.status_of("api"), Some(HealthStatus::Unknown));
        assert!(!monitor.is_service_available("api"));
    }

    #[tokio::test]
    async fn test_successful_probe_is_healthy() {
        let monitor = monitor_with(SequenceProbe::new(vec![Ok(200)]));
        assert_eq!(monitor.check_service("api").await, Some(HealthStatus::Healthy));
        assert!(monitor.is_service_available("api"));

        let snapshot = &monitor.snapshot()[0];
        assert_eq!(snapshot.checks_total, 1);
        assert!(snapshot.last_latency_ms.is_some());
    }

    #[tokio::test]
    async fn test_client_errors_still_count_as_responses() {
        let monitor = monitor_with(SequenceProbe::new(vec![Ok(404), Ok(429)]));
        assert_eq!(monitor.check_service("api").await, Some(HealthStatus::Healthy));
        assert_eq!(monitor.check_service("api").await, Some(HealthStatus::Healthy));
    }

    #[tokio::test]
    async fn test_failures_escalate_to_unhealthy() {
        let monitor = monitor_with(SequenceProbe::new(vec![
            Ok(500),
            Err("connection refused".into()),
            Ok(503),
        ]));

        assert_eq!(monitor.check_service("api").await, Some(HealthStatus::Degraded));
        assert!(monitor.is_service_available("api"));

        assert_eq!(monitor.check_service("api").await, Some(HealthStatus::Degraded));

        // Third consecutive failure crosses the threshold
        assert_eq!(monitor.check_service("api").await, Some(HealthStatus::Unhealthy));
        assert!(!monitor.is_service_available("api"));
    }

    #[tokio::test]
    async fn test_success_resets_failure_streak() {
        let monitor = monitor_with(SequenceProbe::new(vec![
            Ok(500),
            Ok(500),
            Ok(200),
            Ok(500),
        ]));

        monitor.check_service("api").await;
        monitor.check_service("api").await;
        assert_eq!(monitor.check_service("api").await, Some(HealthStatus::Healthy));
        // The streak restarted, so one failure is degraded again
        assert_eq!(monitor.check_service("api").await, Some(HealthStatus::Degraded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_response_is_degraded() {
        let probe = SequenceProbe::new(vec![Ok(200)]).with_delay(Duration::from_secs(6));
        let monitor = monitor_with(probe);

        assert_eq!(monitor.check_service("api").await, Some(HealthStatus::Degraded));
        // Slow but answering still counts as reachable
        assert!(monitor.is_service_available("api"));
        let snapshot = &monitor.snapshot()[0];
        assert_eq!(snapshot.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_is_a_failure() {
        let probe = SequenceProbe::new(vec![Ok(200)]).with_delay(Duration::from_secs(30));
        let monitor = monitor_with(probe);

        assert_eq!(monitor.check_service("api").await, Some(HealthStatus::Degraded));
        assert_eq!(monitor.snapshot()[0].failures_total, 1);
    }

    #[tokio::test]
    async fn test_check_unregistered_service() {
        let monitor = monitor_with(SequenceProbe::new(vec![]));
        assert_eq!(monitor.check_service("nope").await, None);
    }

    struct CountingObserver {
        calls: AtomicUsize,
        last_len: AtomicUsize,
    }

    impl StatusObserver for CountingObserver {
        fn on_status_change(&self, snapshot: &[HealthSnapshot]) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.last_len.store(snapshot.len(), Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_observers_fire_once_per_changed_sweep() {
        let monitor = NetworkMonitor::with_probe(
            NetworkMonitorConfig::default(),
            Arc::new(SequenceProbe::new(vec![])),
        );
        monitor.register_target("api", "http://localhost:9/a");
        monitor.register_target("feed", "http://localhost:9/b");

        let observer = Arc::new(CountingObserver {
            calls: AtomicUsize::new(0),
            last_len: AtomicUsize::new(0),
        });
        monitor.add_observer(observer.clone());

        // First sweep flips both targets from unknown to healthy
        let changed = monitor.check_all_services().await;
        assert_eq!(changed, 2);
        assert_eq!(observer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(observer.last_len.load(Ordering::SeqCst), 2);

        // Nothing changes on the second sweep, so observers stay quiet
        let changed = monitor.check_all_services().await;
        assert_eq!(changed, 0);
        assert_eq!(observer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_service_polls_until_up() {
        let probe = SequenceProbe::new(vec![
            Err("connection refused".into()),
            Err("connection refused".into()),
            Ok(200),
        ]);
        let monitor = monitor_with(probe);

        // Comes up on the third poll, inside the deadline
        assert!(monitor.wait_for_service("api", Duration::from_secs(60)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_service_gives_up_at_deadline() {
        let probe = SequenceProbe::new(vec![
            Err("down".into()),
            Err("down".into()),
            Err("down".into()),
            Err("down".into()),
        ]);
        let monitor = monitor_with(probe);

        let started = Instant::now();
        assert!(!monitor.wait_for_service("api", Duration::from_secs(12)).await);
        assert!(started.elapsed() >= Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_loop_sweeps_and_stops() {
        let monitor = monitor_with(SequenceProbe::new(vec![Ok(200), Ok(200), Ok(200)]));

        monitor.start_monitoring();
        assert!(monitor.is_running());

        // First tick fires immediately once the loop is scheduled
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(monitor.status_of("api"), Some(HealthStatus::Healthy));

        monitor.stop_monitoring();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!monitor.is_running());
    }
}
