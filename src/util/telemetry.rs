//! Telemetry helpers for structured logging and tracing.

use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter for this crate's subscriber.
pub const LOG_ENV: &str = "PROMETHEUS_RWLOCK_LOG";

/// Initialize tracing/telemetry. Users can install their own subscriber; this
/// helper installs a default env-based subscriber if none is set.
///
/// The filter comes from [`LOG_ENV`], then `RUST_LOG`, then `warn`.
pub fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_thread_names(true)
        .try_init();
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"))
}
