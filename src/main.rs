// src/main.rs
use anyhow::Context;
use dotenvy::dotenv;
use std::sync::Arc;
use the_sentinel::config::AppConfig;
use the_sentinel::connectors::binance::BinanceClient;
use the_sentinel::connectors::paper::PaperExchange;
use the_sentinel::connectors::traits::{ExecutionHandler, MarketData, StreamClient};
use the_sentinel::core::cooldown::SignalCooldown;
use the_sentinel::core::engine::TradingEngine;
use the_sentinel::core::reconciler::{Reconciler, ReconcilerSettings};
use the_sentinel::strategies::{self, AtrLevels};
use the_sentinel::utils::clock::SystemClock;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Console plus a daily-rolling file under `logs/`. The guard must live
/// until shutdown or buffered lines are lost.
fn init_logging() -> WorkerGuard {
    let file_appender = tracing_appender::rolling::daily("logs", "sentinel.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("the_sentinel=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .init();
    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let _log_guard = init_logging();

    // 1. Configuration (fatal on error)
    let config = match AppConfig::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return Err(e.into());
        }
    };

    info!(
        symbol = %config.symbol,
        interval = %config.interval,
        leverage = config.leverage,
        risk_fraction = %config.risk_fraction,
        strategy = ?config.strategy.kind,
        mode = if config.live_trading { "LIVE" } else { "PAPER" },
        testnet = config.testnet,
        "THE SENTINEL starting"
    );

    // 2. Symbol rules (unknown symbol is fatal)
    let client = BinanceClient::new(
        config.credentials.clone(),
        config.testnet,
        config.request_timeout(),
    )?;
    let rules = client
        .get_symbol_rules(&config.symbol)
        .await
        .with_context(|| format!("fetching trading rules for {}", config.symbol))?;
    info!(
        step_size = %rules.step_size,
        tick_size = %rules.tick_size,
        min_qty = %rules.min_qty,
        min_notional = %rules.min_notional,
        "Symbol rules loaded"
    );

    // 3. Execution venue
    let client = Arc::new(client.with_rules(rules.clone()));
    let market: Arc<dyn MarketData> = client.clone();
    let execution: Arc<dyn ExecutionHandler> = if config.live_trading {
        client
    } else {
        info!(balance = %config.paper.starting_balance, "Paper trading, orders stay local");
        Arc::new(PaperExchange::new(rules.clone(), config.paper.starting_balance))
    };

    if let Err(e) = execution.set_leverage(&config.symbol, config.leverage).await {
        warn!(error = %e, leverage = config.leverage, "Could not set leverage, continuing");
    }

    // 4. Decision components
    let cooldown = SignalCooldown::new(config.cooldown_secs, Arc::new(SystemClock));
    let levels = AtrLevels::new(config.strategy.sl_atr_mult, config.strategy.tp_atr_mult);
    let reconciler = Reconciler::new(
        execution,
        rules,
        ReconcilerSettings::from_config(&config),
        levels,
        cooldown,
    )?;
    let strategy = strategies::from_config(&config.strategy);

    // 5. Stream first so nothing is missed while history loads
    let (kline_tx, kline_rx) = mpsc::channel(256);
    let mut stream = BinanceClient::new(None, config.testnet, config.request_timeout())?;
    stream
        .subscribe_klines(&config.symbol, &config.interval, kline_tx)
        .await?;

    // 6. Run engine
    let mut engine = TradingEngine::new(config, market, reconciler, strategy, kline_rx);
    engine
        .bootstrap()
        .await
        .context("loading candle history")?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    if let Err(e) = engine.run(shutdown).await {
        error!(error = %e, "Fatal engine error");
        return Err(e);
    }

    info!("Shutdown complete");
    Ok(())
}
