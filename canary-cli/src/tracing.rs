//! Logging initialization

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global tracing subscriber.  `CANARY_LOG` overrides
/// the level; `-d` forces debug.
pub fn init_tracing(debug: bool) -> Result<(), String> {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("CANARY_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| e.to_string())
}
