use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing output for a host binary.
///
/// `RUST_LOG` wins when set; otherwise `log_level` is the default filter.
/// JSON output is for log shippers, the plain layer for terminals.
pub fn init_logger(log_level: &str, json_logs: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

/// Best-effort logger for tests. Safe to call from every test; only the
/// first call in the process wins.
pub fn init_test_logger() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_test_writer())
        .try_init();
}
