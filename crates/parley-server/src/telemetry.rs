//! Logging setup for Parley Server.
//!
//! Console output through `tracing-subscriber`, either human readable or
//! one JSON object per line for log shippers. Broker metrics go through the
//! global OpenTelemetry meter and stay no-ops until a provider is installed.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogConfig, LogFormat};

/// Filter used when neither `RUST_LOG` nor the config sets one.
pub const DEFAULT_FILTER: &str = "info,parley_server=debug,parley_broker=debug";

/// Build the log filter: `RUST_LOG`, then the configured directives, then
/// [`DEFAULT_FILTER`].
pub fn build_filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(config.filter.as_deref().unwrap_or(DEFAULT_FILTER))
    })
}

/// Install the global subscriber.
///
/// # Configuration
///
/// Environment variables:
/// - `RUST_LOG`: Log filter (overrides `log.filter`)
pub fn init(config: &LogConfig) -> Result<()> {
    let filter = build_filter(config);

    match config.format {
        LogFormat::Pretty => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(true)
                .with_line_number(true);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()?;
        }
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_target(true);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()?;
        }
    }

    tracing::info!(format = ?config.format, "Telemetry initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_filter_is_used() {
        // Only meaningful when RUST_LOG is unset, as in CI.
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = LogConfig {
            filter: Some("warn".to_string()),
            ..Default::default()
        };
        assert_eq!(build_filter(&config).to_string(), "warn");
    }

    #[test]
    fn test_default_filter_parses() {
        assert!(DEFAULT_FILTER.parse::<EnvFilter>().is_ok());
    }
}
