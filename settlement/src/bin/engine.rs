//! Settlement engine binary
//!
//! Reads configuration from `ETH_SETTLEMENT_CONFIG` (a TOML file) when set,
//! otherwise from `ETH_SETTLEMENT_*` environment variables.

use eth_settlement_engine::{Config, SettlementEngine};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    info!("Ethereum settlement engine starting...");

    let config = if let Ok(config_path) = std::env::var("ETH_SETTLEMENT_CONFIG") {
        info!("Loading config from: {}", config_path);
        Config::from_file(&config_path)?
    } else {
        info!("Loading config from environment variables");
        Config::from_env()?
    };

    info!(
        "Configuration loaded - min amount: {}, poll interval: {:?}, asset scale: {}",
        config.min_settlement_amount,
        config.poll_interval(),
        config.asset_scale
    );

    let mut engine = SettlementEngine::connect(config).await?;
    engine.start().await?;

    info!("Settlement engine running as {}", engine.address());

    signal::ctrl_c().await?;
    info!("Shutdown signal received");

    engine.disconnect().await?;
    drop(engine);
    info!("Ledger and provider connections closed");
    Ok(())
}
