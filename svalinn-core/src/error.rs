//! Error taxonomy for the resilience layer.
//!
//! Two families:
//! - [`UpstreamError`]: what a third-party call reported (transport
//!   failure, HTTP status, deadline). Carries a structured status code so
//!   callers classify by value instead of matching on error identity.
//! - [`ResilienceError`]: what this layer decided (admission timed out,
//!   circuit open, retries exhausted, no fallback available).

use std::time::Duration;
use thiserror::Error;

/// Failure reported by one upstream service call.
#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    /// Connection-level failure before any HTTP status was received.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// The service answered with a non-success HTTP status.
    #[error("upstream returned status {status}")]
    Status { status: u16 },

    /// The call exceeded its deadline.
    #[error("upstream call timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },
}

impl UpstreamError {
    /// Convenience constructor for connection-level failures.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// HTTP status code, when the failure carries one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status } => Some(*status),
            _ => None,
        }
    }

    /// The upstream asked us to slow down (HTTP 429).
    pub fn is_rate_limited(&self) -> bool {
        self.status_code() == Some(429)
    }

    /// Worth another attempt: transport errors, timeouts, 429 and 5xx.
    /// Other 4xx statuses are caller mistakes and repeat deterministically.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Timeout { .. } => true,
            Self::Status { status } => *status == 429 || *status >= 500,
        }
    }
}

/// Failure produced by the resilience layer itself.
#[derive(Debug, Error)]
pub enum ResilienceError {
    /// A queued admission request outlived the queue timeout.
    #[error("rate limit admission timed out after {waited:?} ({queue_depth} waiters queued)")]
    AdmissionTimeout { waited: Duration, queue_depth: usize },

    /// The breaker rejected the call without a network attempt.
    #[error("circuit '{name}' is open, next trial in {retry_in:?}")]
    CircuitOpen { name: String, retry_in: Duration },

    /// Every attempt failed; the last upstream error is preserved as the source.
    #[error("retries exhausted after {attempts} attempts")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: UpstreamError,
    },

    /// Cache-only fallback had nothing cached for this call.
    #[error("no fallback available for {service}:{operation}")]
    NoFallback {
        service: String,
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A fallback strategy name from configuration did not parse.
    /// Configuration defect, not a transient failure.
    #[error("unknown fallback strategy '{0}'")]
    UnknownStrategy(String),

    /// Upstream failure surfaced unchanged (non-retryable, no fallback in play).
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

impl ResilienceError {
    /// The last upstream error observed, when one is attached.
    pub fn upstream(&self) -> Option<&UpstreamError> {
        match self {
            Self::RetriesExhausted { source, .. } => Some(source),
            Self::Upstream(source) => Some(source),
            _ => None,
        }
    }
}
