//! flowfile-relay entry point.

mod app;
mod config;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Receives FlowFile v3 over HTTP and saves or forwards every record.
#[derive(Debug, Parser)]
#[command(name = "flowfile-relay", version, about)]
struct Cli {
    /// JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides `listen` from the configuration.
    #[arg(short, long)]
    listen: Option<SocketAddr>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,flowfile=debug")),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting flowfile relay");

    let mut config = config::RelayConfig::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    tracing::info!(listen = %config.listen, mode = ?config.mode, "configuration loaded");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config))?;

    tracing::info!("relay shut down cleanly");
    Ok(())
}
