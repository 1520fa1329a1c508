//! Logging setup.
//!
//! Logs go to stderr so a tar streamed to stdout stays clean. `RUST_LOG`
//! takes precedence over the configured level.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global tracing subscriber.
///
/// Returns an error if a subscriber is already installed or the level does
/// not parse as a filter directive.
pub fn init(default_level: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.is_empty() => EnvFilter::try_new(directives)?,
        _ => EnvFilter::try_new(default_level)?,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_target(true).with_level(true))
        .try_init()?;

    tracing::debug!(level = default_level, "Observability initialized");
    Ok(())
}
