//! Logging setup built on `tracing` and `tracing-subscriber`.
//!
//! The `RUST_LOG` environment variable takes precedence over the level
//! passed in, so per-module filtering stays available in the field.

use tracing::Level;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

/// Initializes the global subscriber at `level`.
///
/// Idempotent: a second call (common in tests) is a no-op rather than an
/// error. Thread names go into every line because each task names its
/// thread after the sensor it serves.
pub fn init(level: &str) -> Result<(), String> {
    let level = parse_log_level(level)?;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(level)));

    let fmt_layer = fmt::layer()
        .compact()
        .with_thread_names(true)
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .try_init()
        .or_else(|e| {
            if e.to_string()
                .contains("a global default trace dispatcher has already been set")
            {
                Ok(())
            } else {
                Err(format!("Failed to initialize tracing: {}", e))
            }
        })
}

/// Parse log level string into tracing Level
fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        )),
    }
}

fn level_to_filter_string(level: Level) -> String {
    match level {
        Level::TRACE => "trace".to_string(),
        Level::DEBUG => "debug".to_string(),
        Level::INFO => "info".to_string(),
        Level::WARN => "warn".to_string(),
        Level::ERROR => "error".to_string(),
    }
}
