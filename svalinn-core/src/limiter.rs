//! Rate limiting - priority-aware sliding window admission
//!
//! Keeps outgoing calls inside provider quotas with two sliding windows
//! (per-minute and per-second). Callers that cannot be admitted at once
//! queue as prioritized waiters; a dedicated drain task releases them as
//! capacity frees up.
//!
//! ## Admission flow
//!
//! ```text
//! acquire(priority)
//!        │
//!        ▼
//!   queue empty AND capacity?  ──yes──► record admission, return
//!        │ no
//!        ▼
//!   enqueue waiter (priority desc, arrival asc)
//!        │                         drain task: release up to burst_size
//!        ▼                         waiters per pass, re-poll every 100ms
//!   await handoff ──────────────►  while blocked
//!        │
//!        ▼
//!   admitted, or AdmissionTimeout after queue_timeout
//! ```
//!
//! Upstream 429 responses feed back through [`RateLimiter::record_status`];
//! each consecutive 429 doubles a cooldown (capped at 60s) during which no
//! admission happens.
//!
//! ## Usage
//!
//! ```
//! use svalinn_core::limiter::RateLimiter;
//!
//! async fn fetch_quotes(limiter: &RateLimiter) {
//!     if limiter.acquire_with_priority(10).await.is_ok() {
//!         // call the provider, then report the status code back
//!         limiter.record_status(200);
//!     }
//! }
//! ```

use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::ResilienceError;
use crate::monitoring::{AdmissionMetrics, MetricsRegistry};

const MINUTE_WINDOW: Duration = Duration::from_secs(60);
const SECOND_WINDOW: Duration = Duration::from_secs(1);

/// Rate limiter configuration
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Admissions allowed in any trailing 60s window
    pub calls_per_minute: u32,
    /// Admissions allowed in any trailing 1s window; 0 disables this cap
    pub calls_per_second: u32,
    /// Waiters released per drain pass
    pub burst_size: u32,
    /// How long a queued request may wait for admission
    pub queue_timeout: Duration,
    /// Drain re-poll interval while capacity is exhausted
    pub drain_interval: Duration,
}

impl RateLimiterConfig {
    /// Strict limits for unauthenticated free-tier providers
    pub fn free_tier() -> Self {
        Self {
            calls_per_minute: 5,
            calls_per_second: 1,
            burst_size: 2,
            ..Default::default()
        }
    }

    /// Permissive limits for authenticated trading APIs
    pub fn trading_api() -> Self {
        Self {
            calls_per_minute: 200,
            calls_per_second: 5,
            burst_size: 20,
            ..Default::default()
        }
    }

    /// Derive a config from a per-minute quota. The per-second cap is
    /// `calls_per_minute / 60`; below 60 calls/minute that is 0, which
    /// disables the per-second cap rather than blocking everything.
    pub fn from_calls_per_minute(calls_per_minute: u32) -> Self {
        Self {
            calls_per_minute,
            calls_per_second: calls_per_minute / 60,
            burst_size: (calls_per_minute / 10).max(1),
            ..Default::default()
        }
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            calls_per_minute: 60,
            calls_per_second: 1,
            burst_size: 10,
            queue_timeout: Duration::from_secs(30),
            drain_interval: Duration::from_millis(100),
        }
    }
}

/// Sliding admission record. All methods take `now` so the windows are
/// deterministic under test.
struct AdmissionWindow {
    /// Admission times, oldest first; bounded by calls_per_minute
    timestamps: VecDeque<Instant>,
}

impl AdmissionWindow {
    fn new() -> Self {
        Self {
            timestamps: VecDeque::new(),
        }
    }

    /// Drop admissions older than the minute window
    fn prune(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(MINUTE_WINDOW) else {
            return;
        };
        while self.timestamps.front().is_some_and(|t| *t < cutoff) {
            self.timestamps.pop_front();
        }
    }

    /// Admissions recorded at or after `cutoff`. Timestamps are appended
    /// in order, so scanning from the back stays cheap.
    fn count_since(&self, cutoff: Instant) -> usize {
        self.timestamps
            .iter()
            .rev()
            .take_while(|t| **t >= cutoff)
            .count()
    }

    fn has_capacity(&self, now: Instant, config: &RateLimiterConfig) -> bool {
        if self.timestamps.len() >= config.calls_per_minute as usize {
            return false;
        }
        if config.calls_per_second > 0 {
            if let Some(cutoff) = now.checked_sub(SECOND_WINDOW) {
                if self.count_since(cutoff) >= config.calls_per_second as usize {
                    return false;
                }
            }
        }
        true
    }

    fn record(&mut self, now: Instant) {
        self.timestamps.push_back(now);
    }

    fn len(&self) -> usize {
        self.timestamps.len()
    }
}

/// A queued admission request. Highest priority first; FIFO within a
/// priority via the monotone sequence number.
struct Waiter {
    priority: i32,
    seq: u64,
    enqueued_at: Instant,
    tx: oneshot::Sender<()>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority wins, then earlier arrival
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct LimiterState {
    window: AdmissionWindow,
    queue: BinaryHeap<Waiter>,
    next_seq: u64,
    consecutive_throttles: u32,
    cooldown_until: Option<Instant>,
}

impl LimiterState {
    fn in_cooldown(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }

    fn can_admit(&mut self, now: Instant, config: &RateLimiterConfig) -> bool {
        if self.in_cooldown(now) {
            return false;
        }
        self.window.prune(now);
        self.window.has_capacity(now, config)
    }

    fn note_admission(&mut self, now: Instant) {
        self.window.record(now);
    }
}

struct LimiterShared {
    config: RateLimiterConfig,
    state: Mutex<LimiterState>,
    wake: Arc<Notify>,
    drain_running: AtomicBool,
    admitted: AtomicU64,
    queued: AtomicU64,
    timed_out: AtomicU64,
    abandoned: AtomicU64,
    cooldowns: AtomicU64,
}

/// Counter snapshot, for dashboards and logs
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub total_admitted: u64,
    pub total_queued: u64,
    pub total_timed_out: u64,
    pub total_abandoned: u64,
    pub total_cooldowns: u64,
    pub queue_depth: usize,
}

/// Priority-aware rate limiter. One instance per provider; clones share
/// windows, queue and cooldown state.
pub struct RateLimiter {
    name: String,
    shared: Arc<LimiterShared>,
    metrics: Option<AdmissionMetrics>,
}

impl RateLimiter {
    /// Create a new rate limiter for the named provider
    pub fn new(name: impl Into<String>, config: RateLimiterConfig) -> Self {
        let name = name.into();
        debug!("Creating rate limiter '{}' with config: {:?}", name, config);
        Self {
            name,
            shared: Arc::new(LimiterShared {
                config,
                state: Mutex::new(LimiterState {
                    window: AdmissionWindow::new(),
                    queue: BinaryHeap::new(),
                    next_seq: 0,
                    consecutive_throttles: 0,
                    cooldown_until: None,
                }),
                wake: Arc::new(Notify::new()),
                drain_running: AtomicBool::new(false),
                admitted: AtomicU64::new(0),
                queued: AtomicU64::new(0),
                timed_out: AtomicU64::new(0),
                abandoned: AtomicU64::new(0),
                cooldowns: AtomicU64::new(0),
            }),
            metrics: None,
        }
    }

    /// Attach Prometheus handles; call once at construction time
    pub fn with_metrics(mut self, registry: &MetricsRegistry) -> Self {
        self.metrics = Some(registry.admission().clone());
        self
    }

    /// Acquire one admission at default priority
    pub async fn acquire(&self) -> Result<(), ResilienceError> {
        self.acquire_with_priority(0).await
    }

    /// Acquire one admission, suspending until capacity allows it.
    /// Higher priorities are admitted first; ties are FIFO. Fails with
    /// `AdmissionTimeout` after `queue_timeout` in the queue.
    pub async fn acquire_with_priority(&self, priority: i32) -> Result<(), ResilienceError> {
        let rx = {
            let mut state = self.shared.state.lock();
            let now = Instant::now();
            if state.queue.is_empty() && state.can_admit(now, &self.shared.config) {
                state.note_admission(now);
                drop(state);
                self.note_admitted();
                return Ok(());
            }

            let (tx, rx) = oneshot::channel();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.queue.push(Waiter {
                priority,
                seq,
                enqueued_at: now,
                tx,
            });
            self.shared.queued.fetch_add(1, Ordering::Relaxed);
            self.set_queue_depth(state.queue.len());
            rx
        };

        self.ensure_drain_task();
        self.shared.wake.notify_one();

        let timeout = self.shared.config.queue_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            // Either the timer fired or the sender vanished; both mean
            // this waiter was never admitted
            Ok(Err(_)) | Err(_) => {
                let queue_depth = self.queue_depth();
                self.shared.timed_out.fetch_add(1, Ordering::Relaxed);
                if let Some(m) = &self.metrics {
                    m.timeouts_total.with_label_values(&[&self.name]).inc();
                }
                warn!(
                    "Rate limiter '{}' admission timed out after {:?} ({} waiters queued)",
                    self.name, timeout, queue_depth
                );
                Err(ResilienceError::AdmissionTimeout {
                    waited: timeout,
                    queue_depth,
                })
            }
        }
    }

    /// Non-blocking admission attempt. Never jumps the queue: returns
    /// false whenever waiters are ahead, capacity is exhausted, or a
    /// cooldown is active.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.shared.state.lock();
        let now = Instant::now();
        if !state.queue.is_empty() || !state.can_admit(now, &self.shared.config) {
            return false;
        }
        state.note_admission(now);
        drop(state);
        self.note_admitted();
        true
    }

    /// Feed an upstream HTTP status back into the limiter: 429 starts or
    /// extends a cooldown, any success clears it
    pub fn record_status(&self, status: u16) {
        if status == 429 {
            self.record_throttled();
        } else if status < 400 {
            self.record_success();
        }
    }

    /// The upstream throttled us. Each consecutive 429 doubles the
    /// cooldown: 2s, 4s, 8s, ... capped at 60s.
    pub fn record_throttled(&self) {
        let mut state = self.shared.state.lock();
        let now = Instant::now();
        state.consecutive_throttles = state.consecutive_throttles.saturating_add(1);
        let secs = 1u64
            .checked_shl(state.consecutive_throttles)
            .map_or(60, |v| v.min(60));
        state.cooldown_until = Some(now + Duration::from_secs(secs));
        let streak = state.consecutive_throttles;
        drop(state);

        self.shared.cooldowns.fetch_add(1, Ordering::Relaxed);
        if let Some(m) = &self.metrics {
            m.throttle_cooldowns_total
                .with_label_values(&[&self.name])
                .inc();
        }
        warn!(
            "Rate limiter '{}' backing off {}s after {} consecutive 429s",
            self.name, secs, streak
        );
    }

    /// The upstream answered normally; cooldown state resets
    pub fn record_success(&self) {
        let mut state = self.shared.state.lock();
        if state.consecutive_throttles > 0 {
            debug!("Rate limiter '{}' cooldown cleared", self.name);
        }
        state.consecutive_throttles = 0;
        state.cooldown_until = None;
    }

    /// Remaining cooldown, if one is active
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        let state = self.shared.state.lock();
        let until = state.cooldown_until?;
        let now = Instant::now();
        (now < until).then(|| until - now)
    }

    /// Waiters currently queued
    pub fn queue_depth(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Admissions recorded in the trailing minute window
    pub fn window_len(&self) -> usize {
        let mut state = self.shared.state.lock();
        let now = Instant::now();
        state.window.prune(now);
        state.window.len()
    }

    /// Counter snapshot
    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            total_admitted: self.shared.admitted.load(Ordering::Relaxed),
            total_queued: self.shared.queued.load(Ordering::Relaxed),
            total_timed_out: self.shared.timed_out.load(Ordering::Relaxed),
            total_abandoned: self.shared.abandoned.load(Ordering::Relaxed),
            total_cooldowns: self.shared.cooldowns.load(Ordering::Relaxed),
            queue_depth: self.queue_depth(),
        }
    }

    fn note_admitted(&self) {
        self.shared.admitted.fetch_add(1, Ordering::Relaxed);
        if let Some(m) = &self.metrics {
            m.admissions_total.with_label_values(&[&self.name]).inc();
        }
    }

    fn set_queue_depth(&self, depth: usize) {
        if let Some(m) = &self.metrics {
            m.queue_depth
                .with_label_values(&[&self.name])
                .set(depth as i64);
        }
    }

    /// Spawn the drain task on first use. Runs for the limiter's lifetime
    /// and exits once every handle is gone.
    fn ensure_drain_task(&self) {
        if self
            .shared
            .drain_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let shared = Arc::downgrade(&self.shared);
        let name = self.name.clone();
        let metrics = self.metrics.clone();
        debug!("Rate limiter '{}' drain task starting", name);
        tokio::spawn(drain_loop(shared, name, metrics));
    }
}

impl Clone for RateLimiter {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            shared: Arc::clone(&self.shared),
            metrics: self.metrics.clone(),
        }
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        // Wake the drain task so it can notice when the last handle goes
        self.shared.wake.notify_one();
    }
}

enum PassOutcome {
    /// Queue empty; park until a waiter arrives
    Idle,
    /// Waiters remain but capacity, cooldown or burst stops them
    Blocked,
}

async fn drain_loop(shared: Weak<LimiterShared>, name: String, metrics: Option<AdmissionMetrics>) {
    // Own the Notify so parking stays valid while handles drop
    let wake = match shared.upgrade() {
        Some(strong) => Arc::clone(&strong.wake),
        None => return,
    };

    loop {
        let Some(strong) = shared.upgrade() else {
            break;
        };

        let outcome = release_pass(&strong, &name, &metrics);
        let interval = strong.config.drain_interval;
        drop(strong);

        match outcome {
            PassOutcome::Idle => wake.notified().await,
            PassOutcome::Blocked => tokio::time::sleep(interval).await,
        }
    }
    debug!("Rate limiter '{}' drain task stopped", name);
}

/// One drain pass: hand admissions to queued waiters, best first, at most
/// `burst_size` per pass. Runs entirely under the state lock.
fn release_pass(
    shared: &LimiterShared,
    name: &str,
    metrics: &Option<AdmissionMetrics>,
) -> PassOutcome {
    let mut state = shared.state.lock();
    let now = Instant::now();
    let batch = shared.config.burst_size.max(1);
    let mut released = 0u32;

    let outcome = loop {
        // Discard waiters whose receiving side already gave up
        while state.queue.peek().is_some_and(|w| w.tx.is_closed()) {
            state.queue.pop();
            shared.abandoned.fetch_add(1, Ordering::Relaxed);
        }

        if state.queue.is_empty() {
            break PassOutcome::Idle;
        }
        if released >= batch || !state.can_admit(now, &shared.config) {
            break PassOutcome::Blocked;
        }

        let Some(waiter) = state.queue.pop() else {
            break PassOutcome::Idle;
        };
        let waited = now - waiter.enqueued_at;
        if waiter.tx.send(()).is_ok() {
            state.note_admission(now);
            released += 1;
            shared.admitted.fetch_add(1, Ordering::Relaxed);
            if let Some(m) = metrics {
                m.admissions_total.with_label_values(&[name]).inc();
            }
            debug!(
                "Rate limiter '{}' released waiter (priority {}) after {:?}",
                name, waiter.priority, waited
            );
        } else {
            // Receiver vanished between the closed check and the send
            shared.abandoned.fetch_add(1, Ordering::Relaxed);
        }
    };

    if let Some(m) = metrics {
        m.queue_depth
            .with_label_values(&[name])
            .set(state.queue.len() as i64);
    }
    outcome
}
