//! Graceful degradation under upstream failure
//!
//! Keeps the host usable when services it depends on are not:
//! - Dependency registry with criticality and per-service fallback strategy
//! - Bounded cache of last-good results with read-time freshness
//! - Fallback dispatch (stale cache, mocks, reduced scope, skip, manual)
//! - Derived process-wide service level

pub mod cache;
pub mod dependency;
pub mod manager;

pub use cache::{CacheKey, ResultCache};
pub use dependency::{Criticality, FallbackStrategy, ServiceDependency, ServiceLevel};
pub use manager::{
    CallOptions, DegradationInfo, DegradationManager, DegradationManagerConfig, MockHandler,
    ResultSource, ServiceResult,
};
