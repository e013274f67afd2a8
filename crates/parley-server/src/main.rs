//! Parley Server - WebSocket front end for the chat transport core.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use parley_broker::Broker;
use tracing::info;

mod config;
mod server;
mod telemetry;

use crate::config::{LogFormat, ServerConfig};

/// Parley - real-time chat relay over WebSockets
#[derive(Parser, Debug)]
#[command(name = "parley-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "PARLEY_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on (overrides the config file)
    #[arg(short, long, env = "PARLEY_BIND_ADDR")]
    bind: Option<SocketAddr>,

    /// Log output format (overrides the config file)
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

impl Cli {
    /// Layer command-line flags over the loaded configuration.
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(format) = self.log_format {
            config.log.format = format;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ServerConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);

    if cli.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    telemetry::init(&config.log)?;

    info!("Parley Server starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("License: AGPL-3.0");

    let broker = Arc::new(Broker::new(config.broker.clone()));
    let background = broker.spawn_background();

    server::start(config.bind_addr, Arc::clone(&broker)).await?;

    broker.shutdown();
    futures::future::join_all(background).await;
    info!("Parley Server stopped");

    Ok(())
}
