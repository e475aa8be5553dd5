//! Miner Tunnel Server
//!
//! Accepts encrypted tunnel connections from client edges and relays each
//! virtual circuit to its downstream mining pool.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use miner_tunnel::config::Config;
use miner_tunnel::server::ServerInstance;
use tracing::info;

/// Miner Tunnel Server - encrypted multiplexing relay for mining traffic
#[derive(Parser, Debug)]
#[command(name = "mt-server")]
#[command(about = "Miner Tunnel Server - encrypted multiplexing relay")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Write an example config to the given path and exit
    #[arg(long)]
    generate_config: bool,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Default downstream pool address (overrides config)
    #[arg(short, long)]
    pool: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .init();

    if args.generate_config {
        miner_tunnel::config::generate_example_config()
            .save(&args.config)
            .context("Failed to write example config")?;
        info!("Wrote example config to {}", args.config);
        return Ok(());
    }

    let config = Config::load(&args.config).context("Failed to load configuration")?;
    let mut server_config = config
        .server
        .ok_or_else(|| anyhow!("No [server] section in config file"))?;

    if let Some(listen) = args.listen {
        server_config.listen = listen;
    }
    if let Some(pool) = args.pool {
        server_config.pool_address = pool;
    }

    info!("Miner Tunnel Server v{}", miner_tunnel::VERSION);
    let server = ServerInstance::start(server_config)
        .await
        .context("Failed to start server")?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    server.shutdown().await;
    Ok(())
}
