//! Structured logging setup.
//!
//! Installs a global `tracing` subscriber built from [`LoggingConfig`]. The
//! `RUST_LOG` environment variable, when set, takes precedence over the
//! configured level.

use crate::config::{LogFormat, LoggingConfig};
use crate::{Error, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Build the level filter for a logging configuration.
///
/// # Errors
/// Returns an error if neither `RUST_LOG` nor the configured level parse as a
/// filter directive.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    EnvFilter::try_from_default_env().or_else(|_| {
        EnvFilter::try_new(&config.level).map_err(|e| {
            Error::configuration(format!("invalid log level '{}': {e}", config.level))
        })
    })
}

/// Install the global subscriber.
///
/// Returns `Ok(false)` when a subscriber was already installed, which lets
/// tests and embedded callers invoke this more than once.
///
/// # Errors
/// Returns an error if the level directive is invalid.
pub fn init_logging(config: &LoggingConfig) -> Result<bool> {
    let filter = env_filter(config)?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match config.format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(config.with_target)
                    .with_thread_ids(config.with_thread_ids),
            )
            .try_init(),
        LogFormat::Text => registry
            .with(
                fmt::layer()
                    .with_target(config.with_target)
                    .with_thread_ids(config.with_thread_ids),
            )
            .try_init(),
    };

    Ok(installed.is_ok())
}
