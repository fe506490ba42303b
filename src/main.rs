use anyhow::{bail, Context, Result};
use dotenv::dotenv;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod chain;
mod config;
mod error;
mod models;
mod storage;
mod trading;

use crate::chain::{ChainTransport, EvmTransport};
use crate::config::Config;
use crate::models::TradeStatistics;
use crate::storage::{SledLedger, TradeLedger};
use crate::trading::Engine;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load environment variables
    dotenv().ok();

    match std::env::args().nth(1).as_deref() {
        None | Some("run") => run().await,
        Some("stats") => print_stats().await,
        Some(other) => bail!("Unknown command '{}' (expected 'run' or 'stats')", other),
    }
}

async fn run() -> Result<()> {
    let config = Arc::new(Config::load()?);
    info!("Configuration loaded successfully");

    let ledger = Arc::new(SledLedger::open(&config.db_path).context("Failed to open trade ledger")?);
    let transport = Arc::new(
        EvmTransport::connect(&config)
            .await
            .context("Failed to connect to the chain")?,
    );
    for wallet in transport.wallets() {
        info!("Trading wallet {:?}", wallet);
    }

    let engine = Engine::new(config, transport, ledger);
    engine.start().await?;

    tokio::signal::ctrl_c().await.context("Failed to listen for ctrl-c")?;
    info!("Interrupt received, shutting down");
    engine.stop().await?;
    Ok(())
}

async fn print_stats() -> Result<()> {
    let ledger = SledLedger::open(Config::db_path_from_env()).context("Failed to open trade ledger")?;
    let trades = ledger.all_trades().await?;
    let report = TradeStatistics::from_trades(&trades);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
