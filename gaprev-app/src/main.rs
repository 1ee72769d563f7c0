//! Gap mean-reversion engine runner
//!
//! Loads the TOML configuration, wires the engine to the in-process paper
//! feed and gateway (no live brokerage adapter is compiled into this tree)
//! and runs the polling loop until interrupted.

mod paper;

use anyhow::{Context, Result};
use gaprev_core::{CsvTradeJournal, EngineConfig, NullJournal, TradeJournal, TradingEngine};
use paper::{PaperFeed, PaperGateway};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "gaprev.toml".to_string());
    let config = EngineConfig::load(&config_path)
        .with_context(|| format!("loading configuration from {config_path}"))?;
    info!(
        config = %config_path,
        symbols = config.symbols.len(),
        timeframes = config.timeframes.len(),
        "configuration loaded"
    );

    let journal: Arc<dyn TradeJournal> = if config.journal.enabled {
        Arc::new(CsvTradeJournal::open(&config.journal.path)?)
    } else {
        Arc::new(NullJournal)
    };

    let feed = Arc::new(PaperFeed::new(100.0));
    let gateway = Arc::new(PaperGateway::new(feed.clone(), 10_000.0));
    info!("paper-mode feed and gateway ready");

    let engine = Arc::new(TradingEngine::new(config, feed, gateway, journal).await?);

    let runner = engine.clone();
    let run_task = tokio::spawn(async move { runner.run().await });

    // Periodic statistics report, alongside the trading loop.
    let reporter = engine.clone();
    let stats_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            let stats = reporter.stats();
            let risk = reporter.risk().snapshot();
            info!(
                cycles = stats.cycles,
                bars = stats.bars_processed,
                signals = stats.signals_emitted,
                orders = stats.orders_placed,
                rejections = stats.risk_rejections,
                equity = risk.equity,
                daily_pnl = risk.daily_pnl,
                open = risk.open_global,
                "engine status"
            );
        }
    });

    info!("engine running, press ctrl-c to stop");
    signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutdown signal received");

    engine.stop();
    stats_task.abort();
    let _ = run_task.await;
    info!("shutdown complete");

    Ok(())
}
