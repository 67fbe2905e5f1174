//! Degradation Manager Integration Tests
//!
//! Outage stories through the public call path, with Prometheus
//! assertions where the manager is metrics-wired:
//! - A market data outage served from mock data, then recovered
//! - Compound outages walking the service level down
//! - Cache freshness, forced refresh, and capacity at the call seam
//! - The operator snapshot serialized for dashboards

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde_json::{json, Value};
use svalinn_core::degrade::{
    CallOptions, DegradationManager, DegradationManagerConfig, FallbackStrategy,
    ResultSource, ServiceLevel,
};
use svalinn_core::error::UpstreamError;
use svalinn_core::monitoring::MetricsRegistry;

async fn quote_ok(manager: &DegradationManager, symbol: &str, price: f64) -> ResultSource {
    manager
        .execute_with_fallback("market_data", "quote", symbol, CallOptions::default(), || async move {
            Ok::<_, UpstreamError>(json!({"symbol": symbol, "price": price}))
        })
        .await
        .unwrap()
        .source
}

async fn fail_call(manager: &DegradationManager, service: &str, operation: &str) -> ResultSource {
    manager
        .execute_with_fallback(service, operation, "", CallOptions::bypass_cache(), || async {
            Err::<Value, _>(UpstreamError::Status { status: 503 })
        })
        .await
        .unwrap()
        .source
}

// ============================================================================
// OUTAGE AND RECOVERY
// ============================================================================

/// Test: market_data_outage_served_from_mock_then_recovered
///
/// Healthy quotes flow live and repeat from cache. During the outage
/// the mock strategy answers and the host drops to Minimal. Recovery
/// restores live data and Full service, all visible in the metrics.
#[tokio::test]
async fn test_market_data_outage_served_from_mock_then_recovered() {
    let registry = MetricsRegistry::new().unwrap();
    let manager = DegradationManager::default().with_metrics(&registry);
    manager.register_standard_dependencies();

    // Healthy: live call, then a fresh cache hit
    assert_eq!(quote_ok(&manager, "AAPL", 187.2).await, ResultSource::Upstream);
    assert_eq!(quote_ok(&manager, "AAPL", 187.2).await, ResultSource::Cache);
    assert_eq!(
        registry
            .fallback()
            .cache_hits_total
            .with_label_values(&["market_data"])
            .get(),
        1
    );

    // Outage: the provider starts failing
    let source = fail_call(&manager, "market_data", "quote").await;
    assert_eq!(source, ResultSource::Fallback(FallbackStrategy::MockData));
    assert!(!manager.is_available("market_data"));
    assert_eq!(manager.current_level(), ServiceLevel::Minimal);
    assert_eq!(registry.fallback().service_level.get(), ServiceLevel::Minimal as i64);
    assert_eq!(
        registry
            .fallback()
            .fallbacks_total
            .with_label_values(&["market_data", "mock_data"])
            .get(),
        1
    );

    // Recovery: a live response marks the service back up
    let result = manager
        .execute_with_fallback("market_data", "quote", "AAPL", CallOptions::bypass_cache(), || async {
            Ok::<_, UpstreamError>(json!({"symbol": "AAPL", "price": 188.0}))
        })
        .await
        .unwrap();
    assert_eq!(result.source, ResultSource::Upstream);
    assert_eq!(manager.current_level(), ServiceLevel::Full);
    assert_eq!(registry.fallback().service_level.get(), ServiceLevel::Full as i64);
}

/// Test: compound_outage_walks_the_level_down
///
/// Failures arriving through guarded calls, not operator marks: an
/// optional outage leaves Full, an important one lands on Degraded, a
/// critical one on Minimal, each with its own fallback flavor.
#[tokio::test]
async fn test_compound_outage_walks_the_level_down() {
    let manager = DegradationManager::default();
    manager.register_standard_dependencies();

    let source = fail_call(&manager, "news_feed", "headlines").await;
    assert_eq!(source, ResultSource::Fallback(FallbackStrategy::SkipFeature));
    assert_eq!(manager.current_level(), ServiceLevel::Full);

    let source = fail_call(&manager, "broker_api", "submit_order").await;
    assert_eq!(source, ResultSource::Fallback(FallbackStrategy::ManualMode));
    assert_eq!(manager.current_level(), ServiceLevel::Degraded);

    let source = fail_call(&manager, "market_data", "quote").await;
    assert_eq!(source, ResultSource::Fallback(FallbackStrategy::MockData));
    assert_eq!(manager.current_level(), ServiceLevel::Minimal);

    let info = manager.get_degradation_info();
    assert_eq!(
        info.unavailable_services,
        vec!["broker_api", "market_data", "news_feed"]
    );
}

// ============================================================================
// CACHE AT THE CALL SEAM
// ============================================================================

/// Test: cache_expiry_goes_back_upstream
///
/// A fresh hit skips the closure; once the entry ages past the TTL the
/// next call reaches upstream again.
#[tokio::test(start_paused = true)]
async fn test_cache_expiry_goes_back_upstream() {
    let manager = DegradationManager::default();
    manager.register_standard_dependencies();
    let upstream_calls = AtomicU32::new(0);

    let call = || {
        let options = CallOptions {
            use_cache: true,
            cache_ttl: Duration::from_secs(60),
        };
        manager.execute_with_fallback("market_data", "quote", "NVDA", options, || {
            upstream_calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, UpstreamError>(json!({"price": 900})) }
        })
    };

    call().await.unwrap();
    assert_eq!(upstream_calls.load(Ordering::SeqCst), 1);

    // Still fresh at 59s
    tokio::time::advance(Duration::from_secs(59)).await;
    let result = call().await.unwrap();
    assert_eq!(result.source, ResultSource::Cache);
    assert_eq!(upstream_calls.load(Ordering::SeqCst), 1);

    // Expired at 61s
    tokio::time::advance(Duration::from_secs(2)).await;
    let result = call().await.unwrap();
    assert_eq!(result.source, ResultSource::Upstream);
    assert_eq!(upstream_calls.load(Ordering::SeqCst), 2);
}

/// Test: bypass_cache_forces_a_refresh
///
/// bypass_cache always runs the closure and replaces the stored copy,
/// so the next cached read sees the new value.
#[tokio::test]
async fn test_bypass_cache_forces_a_refresh() {
    let manager = DegradationManager::default();
    manager.register_standard_dependencies();

    assert_eq!(quote_ok(&manager, "AAPL", 187.2).await, ResultSource::Upstream);

    let refreshed = manager
        .execute_with_fallback("market_data", "quote", "AAPL", CallOptions::bypass_cache(), || async {
            Ok::<_, UpstreamError>(json!({"symbol": "AAPL", "price": 190.5}))
        })
        .await
        .unwrap();
    assert_eq!(refreshed.source, ResultSource::Upstream);

    let cached = manager
        .execute_with_fallback("market_data", "quote", "AAPL", CallOptions::default(), || async {
            panic!("upstream called despite fresh cache");
            #[allow(unreachable_code)]
            Ok::<_, UpstreamError>(Value::Null)
        })
        .await
        .unwrap();
    assert_eq!(cached.source, ResultSource::Cache);
    assert_eq!(cached.value["price"], 190.5);
}

/// Test: cache_capacity_evicts_the_oldest_entry
#[tokio::test]
async fn test_cache_capacity_evicts_the_oldest_entry() {
    let manager = DegradationManager::new(DegradationManagerConfig {
        cache_max_entries: 2,
    });
    manager.register_standard_dependencies();

    for symbol in ["AAPL", "MSFT", "NVDA"] {
        quote_ok(&manager, symbol, 100.0).await;
    }
    assert_eq!(manager.cache_usage(), (2, 2));

    // The oldest entry (AAPL) was evicted; its next read goes upstream
    let calls = AtomicU32::new(0);
    let result = manager
        .execute_with_fallback("market_data", "quote", "AAPL", CallOptions::default(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, UpstreamError>(json!({"price": 101})) }
        })
        .await
        .unwrap();
    assert_eq!(result.source, ResultSource::Upstream);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ============================================================================
// OPERATOR SURFACE
// ============================================================================

/// Test: operator_snapshot_serializes_for_dashboards
///
/// The posture summary and dependency snapshot both render as JSON with
/// snake_case enums, ready for an ops endpoint.
#[tokio::test]
async fn test_operator_snapshot_serializes_for_dashboards() {
    let manager = DegradationManager::default();
    manager.register_standard_dependencies();
    fail_call(&manager, "market_data", "quote").await;

    let info = serde_json::to_value(manager.get_degradation_info()).unwrap();
    assert_eq!(info["level"], "minimal");
    assert_eq!(info["unavailable_services"][0], "market_data");
    assert!(info["recommendations"].as_array().is_some_and(|r| !r.is_empty()));

    let status = serde_json::to_value(manager.get_service_status()).unwrap();
    assert_eq!(status["market_data"]["criticality"], "critical");
    assert_eq!(status["market_data"]["fallback_strategy"], "mock_data");
    assert_eq!(status["market_data"]["is_available"], false);
    assert_eq!(status["market_data"]["failure_count"], 1);
    assert_eq!(status["news_feed"]["fallback_strategy"], "skip_feature");
}
