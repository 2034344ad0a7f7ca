use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use clickhouse_relay::{Config, HttpRelay};

#[derive(Parser, Debug)]
#[command(name = "clickhouse-relay")]
#[command(about = "Write-fan-out relay for the ClickHouse HTTP protocol")]
struct Args {
    #[arg(short, long, default_value = "relay.yaml")]
    config: String,

    #[arg(short, long)]
    validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load(&args.config).await?;

    if args.validate_config {
        info!("Configuration is valid");
        return Ok(());
    }

    if config.http.is_empty() {
        anyhow::bail!("no http relays configured");
    }

    let mut relays = Vec::with_capacity(config.http.len());
    for relay_cfg in config.http {
        relays.push(HttpRelay::start(relay_cfg).await?);
    }

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    for relay in &relays {
        relay.stop().await;
    }

    info!("Relay shutdown complete");
    Ok(())
}
