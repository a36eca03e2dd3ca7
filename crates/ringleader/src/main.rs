use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use ringleader::{Broker, BrokerConfig};
use ringproto::endpoint::Flavor;
use ringproto::interrupt;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// The ringleader service broker
///
/// Binds a broker endpoint and mediates between clients and workers
/// speaking the Majordomo protocol. Tuning can also come from the
/// environment (RINGLEADER_HEARTBEAT_IVL_MS, RINGLEADER_LIVENESS); flags
/// win over the environment.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Address to bind: tcp://host:port (envelope) or inproc://name (connection)
    #[arg(short, long, default_value = "tcp://127.0.0.1:5555")]
    bind: String,

    /// Transport flavor: "envelope" or "connection"
    #[arg(short, long, default_value = "envelope")]
    flavor: String,

    /// Heartbeat interval in milliseconds
    #[arg(long)]
    heartbeat_ivl_ms: Option<u64>,

    /// Missed heartbeats tolerated before a worker is purged
    #[arg(long)]
    liveness: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let flavor: Flavor = cli.flavor.parse().context("invalid transport flavor")?;

    let mut config = BrokerConfig::from_env();
    if let Some(ms) = cli.heartbeat_ivl_ms {
        config.heartbeat_interval = Duration::from_millis(ms);
    }
    if let Some(liveness) = cli.liveness {
        config.liveness = liveness;
    }

    interrupt::install_signal_handlers();

    let mut broker = Broker::bind(flavor, &cli.bind, config)
        .await
        .with_context(|| format!("failed to bind broker to {}", cli.bind))?;
    info!(address = broker.local_addr(), "ringleader listening");

    broker.run(CancellationToken::new()).await?;
    info!("shutdown complete");
    Ok(())
}
