#![forbid(unsafe_code)]

use tracing_subscriber::EnvFilter;

pub const LOG_ENV_VAR: &str = "TALLY_LOG";

/// Installs a global `fmt` subscriber.
///
/// Filter precedence: `TALLY_LOG`, then `fallback`, then `info`. Calling it again
/// after a subscriber is installed is a no-op.
pub fn init_tracing(fallback: Option<&str>) {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR)
        .or_else(|_| EnvFilter::try_new(fallback.unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
