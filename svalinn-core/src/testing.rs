//! Deterministic fakes for exercising the resilience layer
//!
//! Public rather than test-only so integration tests, benches, and examples
//! can script upstream behavior without sockets.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::error::UpstreamError;
use crate::health::probe::{HealthProbe, ProbeFuture};

fn ok_payload() -> Value {
    json!({"status": "ok"})
}

/// Scripted upstream service. Plays back a queue of outcomes, then keeps
/// returning its exhausted-script outcome. Clones share the script and
/// the call counter.
#[derive(Clone)]
pub struct FlakyService {
    script: Arc<Mutex<VecDeque<Result<Value, UpstreamError>>>>,
    exhausted: Arc<Result<Value, UpstreamError>>,
    calls: Arc<AtomicU64>,
}

impl FlakyService {
    pub fn from_script(
        script: Vec<Result<Value, UpstreamError>>,
        exhausted: Result<Value, UpstreamError>,
    ) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            exhausted: Arc::new(exhausted),
            calls: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Service that fails `n` times with `err`, then succeeds forever
    pub fn fail_n_then_succeed(n: usize, err: UpstreamError) -> Self {
        let script = std::iter::repeat_with(|| Err(err.clone())).take(n).collect();
        Self::from_script(script, Ok(ok_payload()))
    }

    /// Service that never recovers
    pub fn always_fail(err: UpstreamError) -> Self {
        Self::from_script(Vec::new(), Err(err))
    }

    pub fn always_succeed() -> Self {
        Self::from_script(Vec::new(), Ok(ok_payload()))
    }

    /// Script from HTTP status codes: 2xx becomes a success payload,
    /// anything else a status error
    pub fn from_statuses(statuses: Vec<u16>) -> Self {
        let script = statuses
            .into_iter()
            .map(|status| {
                if (200..300).contains(&status) {
                    Ok(ok_payload())
                } else {
                    Err(UpstreamError::Status { status })
                }
            })
            .collect();
        Self::from_script(script, Ok(ok_payload()))
    }

    /// Perform one scripted call
    pub async fn call(&self) -> Result<Value, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().pop_front();
        match next {
            Some(outcome) => outcome,
            None => (*self.exhausted).clone(),
        }
    }

    /// How many times the service has been called
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Scripted health probe transport. Plays back status outcomes, then keeps
/// returning the configured default; an optional delay simulates latency.
pub struct ScriptedProbe {
    responses: Mutex<VecDeque<Result<u16, String>>>,
    default: Result<u16, String>,
    delay: Option<Duration>,
    probes: AtomicU64,
}

impl ScriptedProbe {
    pub fn new(responses: Vec<Result<u16, String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            default: Ok(200),
            delay: None,
            probes: AtomicU64::new(0),
        }
    }

    /// Probe that always yields one status code
    pub fn always(status: u16) -> Self {
        let mut probe = Self::new(Vec::new());
        probe.default = Ok(status);
        probe
    }

    /// Probe that never gets a response
    pub fn unreachable_host() -> Self {
        let mut probe = Self::new(Vec::new());
        probe.default = Err("connection refused".to_string());
        probe
    }

    /// Delay every response, so latency thresholds can be exercised
    /// under a paused clock
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn probes(&self) -> u64 {
        self.probes.load(Ordering::SeqCst)
    }
}

impl HealthProbe for ScriptedProbe {
    fn probe<'a>(&'a self, _url: &'a str) -> ProbeFuture<'a> {
        Box::pin(async move {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let next = self.responses.lock().pop_front();
            match next {
                Some(outcome) => outcome,
                None => self.default.clone(),
            }
        })
    }
}
