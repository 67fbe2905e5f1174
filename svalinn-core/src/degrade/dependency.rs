//! Service dependency vocabulary
//!
//! Every upstream the host relies on is registered as a dependency with a
//! criticality and a fallback strategy. The process-wide service level is
//! derived from which dependencies are currently available.

use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ResilienceError;

/// How much the host depends on one service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    /// Core operation stops without it
    Critical,
    /// The feature set shrinks without it
    Important,
    /// Losing it is barely visible
    Optional,
}

/// What to serve once a call has failed for good
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    /// The most recent cached value, however old
    CacheOnly,
    /// A registered handler's payload, static data, or a generic mock
    MockData,
    /// A deliberately limited result
    ReducedScope,
    /// Nothing; the caller omits the feature
    SkipFeature,
    /// A sentinel demanding operator action
    ManualMode,
}

impl FallbackStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CacheOnly => "cache_only",
            Self::MockData => "mock_data",
            Self::ReducedScope => "reduced_scope",
            Self::SkipFeature => "skip_feature",
            Self::ManualMode => "manual_mode",
        }
    }
}

impl fmt::Display for FallbackStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FallbackStrategy {
    type Err = ResilienceError;

    /// Parse a strategy name from configuration. Unknown names are a
    /// configuration defect, not a transient failure.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cache_only" => Ok(Self::CacheOnly),
            "mock_data" => Ok(Self::MockData),
            "reduced_scope" => Ok(Self::ReducedScope),
            "skip_feature" => Ok(Self::SkipFeature),
            "manual_mode" => Ok(Self::ManualMode),
            other => Err(ResilienceError::UnknownStrategy(other.to_string())),
        }
    }
}

/// One registered upstream dependency
#[derive(Debug, Clone, Serialize)]
pub struct ServiceDependency {
    pub name: String,
    pub criticality: Criticality,
    pub fallback_strategy: FallbackStrategy,
    /// Served by the mock_data strategy when no handler is registered
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_data: Option<Value>,
    pub is_available: bool,
    pub last_failure: Option<SystemTime>,
    pub failure_count: u64,
}

impl ServiceDependency {
    /// Register a dependency; starts available with a clean history
    pub fn new(
        name: impl Into<String>,
        criticality: Criticality,
        fallback_strategy: FallbackStrategy,
    ) -> Self {
        Self {
            name: name.into(),
            criticality,
            fallback_strategy,
            fallback_data: None,
            is_available: true,
            last_failure: None,
            failure_count: 0,
        }
    }

    /// Attach a static payload for the mock_data strategy
    pub fn with_fallback_data(mut self, data: Value) -> Self {
        self.fallback_data = Some(data);
        self
    }
}

/// Process-wide availability classification. Ordered by severity, so
/// `Degraded > Full` reads as "worse than".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceLevel {
    /// Everything available
    Full,
    /// Important services are running on fallbacks
    Degraded,
    /// A critical service is down; core operation only
    Minimal,
    /// More than one critical service is down
    Offline,
}

impl ServiceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Degraded => "degraded",
            Self::Minimal => "minimal",
            Self::Offline => "offline",
        }
    }
}

impl fmt::Display for ServiceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
