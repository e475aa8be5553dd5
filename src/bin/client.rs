//! Miner Tunnel Client
//!
//! Listens for local miner connections and multiplexes them over a pool of
//! encrypted tunnels to the server edge.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use miner_tunnel::client::ClientInstance;
use miner_tunnel::config::Config;
use tracing::info;

/// Miner Tunnel Client - local edge of the encrypted mining relay
#[derive(Parser, Debug)]
#[command(name = "mt-client")]
#[command(about = "Miner Tunnel Client - local edge of the encrypted relay")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Local listen address for miners (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Server tunnel endpoint (overrides config)
    #[arg(short, long)]
    remote: Option<String>,

    /// Tunnel pool size (overrides config)
    #[arg(short, long)]
    max_conn: Option<usize>,

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

    let config = Config::load(&args.config).context("Failed to load configuration")?;
    let mut client_config = config
        .client
        .ok_or_else(|| anyhow!("No [client] section in config file"))?;

    if let Some(listen) = args.listen {
        client_config.listen = listen;
    }
    if let Some(remote) = args.remote {
        client_config.remote = remote;
    }
    if let Some(max_conn) = args.max_conn {
        client_config.max_conn = max_conn;
    }

    info!("Miner Tunnel Client v{}", miner_tunnel::VERSION);
    let client = ClientInstance::start(client_config)
        .await
        .context("Failed to start client")?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    client.shutdown().await;
    Ok(())
}
