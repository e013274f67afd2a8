//! Server configuration.
//!
//! Layered, lowest priority first: built-in defaults, an optional TOML file,
//! `PARLEY__*` environment variables (`__` separates nesting levels, e.g.
//! `PARLEY__BROKER__REPLAY_BUFFER_SIZE=512`), then command-line flags.

use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use parley_broker::BrokerConfig;
use serde::{Deserialize, Serialize};

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "PARLEY";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable, one line per event
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Output format
    pub format: LogFormat,
    /// Filter directives; `RUST_LOG` wins when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

/// Main configuration struct
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP/WebSocket listener binds to
    pub bind_addr: SocketAddr,
    /// Logging configuration
    pub log: LogConfig,
    /// Broker limits and timeouts
    pub broker: BrokerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            log: LogConfig::default(),
            broker: BrokerConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from defaults, an optional file and the environment.
    ///
    /// A missing file is an error when a path is given explicitly.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder().add_source(
            ::config::Config::try_from(&Self::default())
                .context("Failed to serialize default configuration")?,
        );

        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        let config: Self = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        Ok(config)
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}
