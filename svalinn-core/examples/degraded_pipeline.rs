//! Degraded Pipeline Example
//!
//! Walks the full resilience stack through an upstream outage:
//! - Rate limiter admission and provider-throttle cooldowns
//! - Breaker-routed retries tripping into fail-fast
//! - Mock fallbacks and the derived service level
//! - Health probing an endpoint back to life
//! - Prometheus export of the whole story
//!
//! Run with: cargo run --example degraded_pipeline

use std::sync::Arc;
use std::time::Duration;

use svalinn_core::monitoring::{MetricsServer, MetricsServerConfig};
use svalinn_core::prelude::*;
use svalinn_core::testing::{FlakyService, ScriptedProbe};
use svalinn_core::utils::logger::init_logger;

/// One guarded call the way a host request path wires it: admission,
/// then breaker-routed retries, then fallback handling.
async fn guarded_quote(
    limiter: &RateLimiter,
    engine: &RetryEngine,
    breaker: &CircuitBreaker,
    manager: &DegradationManager,
    service: &FlakyService,
) -> anyhow::Result<()> {
    limiter.acquire().await?;
    let result = manager
        .execute_with_fallback(
            "market_data",
            "quote",
            "AAPL",
            CallOptions::bypass_cache(),
            || async { engine.execute_with_breaker(|| service.call(), breaker).await },
        )
        .await?;
    println!(
        "   -> {:?} (degraded: {}): {}",
        result.source, result.degraded, result.value
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger("warn", false);

    println!("╔═══════════════════════════════════════════════════════════╗");
    println!("║   Resilience Stack Walkthrough                            ║");
    println!("╚═══════════════════════════════════════════════════════════╝\n");

    // ===================================================================
    // STEP 1: Shared metrics registry
    // ===================================================================
    println!("📊 Setting up Prometheus metrics...");
    let registry = MetricsRegistry::new()?;
    println!("   ✓ One registry shared by every layer\n");

    // ===================================================================
    // STEP 2: Rate limiter with throttle cooldowns
    // ===================================================================
    println!("🚦 Admission control...");
    let limiter = RateLimiter::new("market_data", RateLimiterConfig::from_calls_per_minute(120))
        .with_metrics(&registry);
    limiter.acquire().await?;
    println!("   ✓ Admitted inside the 120/min window");

    limiter.record_status(429);
    println!(
        "   ✓ Provider throttled us: cooldown {:?}",
        limiter.cooldown_remaining().unwrap_or_default()
    );
    limiter.record_status(200);
    println!("   ✓ Next success cleared the cooldown\n");

    // ===================================================================
    // STEP 3: Breaker-routed retries
    // ===================================================================
    println!("🔌 Circuit breaker and retry engine...");
    let breaker = CircuitBreaker::new(
        "market_data",
        CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_millis(500),
        },
    )
    .with_metrics(&registry);
    let engine = RetryEngine::new(RetryConfig {
        max_retries: 2,
        initial_delay: Duration::from_millis(100),
        ..RetryConfig::default()
    })
    .with_metrics(&registry);
    println!("   ✓ Trips after 3 failures, probes again after 500ms\n");

    // ===================================================================
    // STEP 4: Degradation manager with fallbacks
    // ===================================================================
    println!("🛟 Fallback strategies...");
    let manager = DegradationManager::default().with_metrics(&registry);
    manager.register_standard_dependencies();
    manager.register_mock_handler(
        "market_data",
        Arc::new(|operation, args| {
            serde_json::json!({"op": operation, "args": args, "price": 0.0, "mock": true})
        }),
    );
    println!("   ✓ market_data (critical, mock), broker_api (important, manual),");
    println!("     portfolio_store (important, cache), news_feed (optional, skip)\n");

    // ===================================================================
    // STEP 5: Healthy traffic
    // ===================================================================
    println!("✅ Healthy upstream:");
    let healthy = FlakyService::always_succeed();
    guarded_quote(&limiter, &engine, &breaker, &manager, &healthy).await?;
    println!("   Service level: {}\n", manager.current_level());

    // ===================================================================
    // STEP 6: Outage
    // ===================================================================
    println!("💥 Upstream outage (every call returns 503):");
    let down = FlakyService::always_fail(UpstreamError::Status { status: 503 });

    // First call burns the retry budget and trips the breaker
    guarded_quote(&limiter, &engine, &breaker, &manager, &down).await?;
    println!("   Breaker state: {:?}", breaker.state());

    // Later calls fail fast into the mock without touching the network
    guarded_quote(&limiter, &engine, &breaker, &manager, &down).await?;
    println!("   Upstream calls during fail-fast: {}", down.calls());
    println!("   Service level: {}\n", manager.current_level());

    // ===================================================================
    // STEP 7: Recovery
    // ===================================================================
    println!("🔄 Waiting out the recovery timeout...");
    tokio::time::sleep(Duration::from_millis(600)).await;
    guarded_quote(&limiter, &engine, &breaker, &manager, &healthy).await?;
    println!("   Breaker state: {:?}", breaker.state());
    println!("   Service level: {}\n", manager.current_level());

    // ===================================================================
    // STEP 8: Health monitoring
    // ===================================================================
    println!("🩺 Probing an endpoint back to life...");
    let probe = Arc::new(ScriptedProbe::new(vec![
        Err("connection refused".into()),
        Err("connection refused".into()),
        Err("connection refused".into()),
    ]));
    let monitor = NetworkMonitor::with_probe(NetworkMonitorConfig::default(), probe)
        .with_metrics(&registry);
    monitor.register_target("market_data", "http://md.internal/health");

    for sweep in 1..=4 {
        monitor.check_all_services().await;
        println!(
            "   Sweep {}: market_data is {:?}",
            sweep,
            monitor.status_of("market_data").unwrap_or(HealthStatus::Unknown)
        );
    }
    println!();

    // ===================================================================
    // STEP 9: Prometheus export
    // ===================================================================
    println!("🌐 Metrics server configuration:");
    let server = MetricsServer::new(MetricsServerConfig::default(), Arc::new(registry));
    println!("   ✓ Scrape URL: http://127.0.0.1:9090/metrics");
    println!("     (spawn server.serve() in production)\n");

    println!("Sample of the export:");
    let export = server.serve_metrics_once()?;
    for line in export.lines().filter(|l| l.starts_with("svalinn_")).take(8) {
        println!("   {line}");
    }
    println!();

    // ===================================================================
    // Summary
    // ===================================================================
    println!("╔═══════════════════════════════════════════════════════════╗");
    println!("║   Walkthrough Complete                                    ║");
    println!("╚═══════════════════════════════════════════════════════════╝\n");

    let stats = limiter.stats();
    println!("Final accounting:");
    println!("  • Admissions: {}", stats.total_admitted);
    println!("  • Throttle cooldowns: {}", stats.total_cooldowns);
    println!("  • Breaker rejections: {}", breaker.rejection_count());
    println!("  • Service level: {}", manager.current_level());
    println!();

    Ok(())
}
