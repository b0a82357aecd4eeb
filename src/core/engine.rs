// src/core/engine.rs
use crate::config::AppConfig;
use crate::connectors::traits::MarketData;
use crate::core::cooldown::LastSignal;
use crate::core::reconciler::{Reconciler, TickInput, TickOutcome};
use crate::core::series::{CandleSeries, SeriesUpdate};
use crate::errors::ExchangeError;
use crate::indicators::FeatureWindow;
use crate::strategies::Strategy;
use crate::types::Candle;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default, Serialize, Deserialize)]
struct EngineState {
    last_signal: Option<LastSignal>,
}

/// Single consumer of the candle stream. Each update is fully reconciled
/// before the next one is read, so decisions for the symbol never overlap.
pub struct TradingEngine {
    config: AppConfig,
    market: Arc<dyn MarketData>,
    reconciler: Reconciler,
    strategy: Box<dyn Strategy>,
    series: CandleSeries,
    kline_receiver: mpsc::Receiver<Candle>,
    state_file: String,
    last_outcome: Option<&'static str>,
}

impl TradingEngine {
    pub fn new(
        config: AppConfig,
        market: Arc<dyn MarketData>,
        reconciler: Reconciler,
        strategy: Box<dyn Strategy>,
        kline_receiver: mpsc::Receiver<Candle>,
    ) -> Self {
        let capacity = usize::from(config.history_limit);
        let state_file = config.state_file.clone();
        Self {
            config,
            market,
            reconciler,
            strategy,
            series: CandleSeries::new(capacity),
            kline_receiver,
            state_file,
            last_outcome: None,
        }
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn series(&self) -> &CandleSeries {
        &self.series
    }

    async fn load_state(&mut self) {
        let Ok(data) = tokio::fs::read_to_string(&self.state_file).await else {
            return;
        };
        match serde_json::from_str::<EngineState>(&data) {
            Ok(state) => {
                info!(last_signal = ?state.last_signal, "Restored engine state");
                self.reconciler.restore_last_signal(state.last_signal);
            }
            Err(e) => warn!(file = %self.state_file, error = %e, "Ignoring unreadable state file"),
        }
    }

    async fn save_state(&self) {
        let state = EngineState {
            last_signal: self.reconciler.last_signal(),
        };
        if let Ok(data) = serde_json::to_string_pretty(&state) {
            if let Err(e) = tokio::fs::write(&self.state_file, data).await {
                error!(file = %self.state_file, error = %e, "Failed to save engine state");
            }
        }
    }

    /// Restores persisted state and seeds the candle window from REST history.
    pub async fn bootstrap(&mut self) -> Result<(), ExchangeError> {
        self.load_state().await;

        let history = self
            .market
            .get_klines(
                &self.config.symbol,
                &self.config.interval,
                self.config.history_limit,
            )
            .await?;
        info!(
            symbol = %self.config.symbol,
            interval = %self.config.interval,
            candles = history.len(),
            "Loaded candle history"
        );
        self.series = CandleSeries::with_history(usize::from(self.config.history_limit), history);
        Ok(())
    }

    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!(
            symbol = %self.config.symbol,
            strategy = self.strategy.name(),
            live = self.config.live_trading,
            "Engine loop running"
        );

        let mut heartbeat = tokio::time::interval(Duration::from_secs(self.config.heartbeat_secs.max(1)));
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                maybe_candle = self.kline_receiver.recv() => match maybe_candle {
                    Some(candle) => {
                        self.on_candle(candle).await;
                    }
                    None => {
                        warn!("Kline stream closed, stopping engine");
                        break;
                    }
                },
                _ = heartbeat.tick() => self.heartbeat(),
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        self.save_state().await;
        Ok(())
    }

    /// Folds one streamed candle into the window and reconciles if it warrants
    /// a decision. Returns `None` when no tick was evaluated.
    pub async fn on_candle(&mut self, candle: Candle) -> Option<TickOutcome> {
        let is_closed = candle.is_closed;
        let price = candle.close;

        match self.series.apply(candle) {
            SeriesUpdate::Stale => {
                debug!("Ignoring stale candle");
                return None;
            }
            SeriesUpdate::Appended | SeriesUpdate::Updated => {}
        }

        self.reconciler.observe_price(price);

        if self.config.evaluate_on_close_only && !is_closed {
            return None;
        }
        Some(self.evaluate().await)
    }

    pub async fn evaluate(&mut self) -> TickOutcome {
        let window = match FeatureWindow::from_candles(self.series.as_slice(), &self.config.strategy) {
            Ok(w) => w,
            Err(e) => {
                error!(error = %e, "Indicator configuration is invalid");
                return TickOutcome::Indeterminate;
            }
        };
        let Some(current) = window.current else {
            debug!(candles = self.series.len(), "Indicators warming up");
            return TickOutcome::Indeterminate;
        };
        let Some(price) = self.series.last().map(|c| c.close) else {
            return TickOutcome::Indeterminate;
        };

        let signal = self.strategy.generate(&current, window.previous.as_ref());
        debug!(
            side = ?signal.side,
            trend = ?current.trend,
            ema_fast = current.ema_fast,
            ema_slow = current.ema_slow,
            rsi_fast = current.rsi_fast,
            rsi_slow = current.rsi_slow,
            atr = current.atr,
            "Signal evaluated"
        );

        let before = self.reconciler.last_signal();
        let outcome = self
            .reconciler
            .tick(TickInput {
                signal: &signal,
                row: &current,
                price,
            })
            .await;
        self.log_outcome(&outcome);

        if self.reconciler.last_signal() != before {
            self.save_state().await;
        }
        self.last_outcome = Some(outcome.status());
        outcome
    }

    fn log_outcome(&self, outcome: &TickOutcome) {
        let status = outcome.status();
        match outcome {
            TickOutcome::Unprotected(alarm) => {
                error!(status, side = %alarm.side, quantity = %alarm.quantity, "Position unprotected")
            }
            TickOutcome::OutcomeUnknown { action, error } => {
                error!(status, action, error = %error, "Exchange state unknown")
            }
            TickOutcome::CloseUnconfirmed { remaining } => {
                error!(status, %remaining, "Reversal halted, close unconfirmed")
            }
            TickOutcome::Aborted(e) => warn!(status, error = %e, "Tick aborted"),
            TickOutcome::Rejected(e) => warn!(status, reason = %e, "Order rejected locally"),
            TickOutcome::ClosedOnly { closed, follow_up } => {
                warn!(status, closed = %closed, follow_up = follow_up.status(), "Closed without re-entry")
            }
            TickOutcome::Opened(entry) => info!(
                status,
                side = ?entry.side,
                quantity = %entry.quantity,
                stop_loss = %entry.stop_loss,
                take_profit = %entry.take_profit,
                "Entered position"
            ),
            TickOutcome::Flipped { closed, entry, .. } => info!(
                status,
                closed = %closed,
                side = ?entry.side,
                quantity = %entry.quantity,
                "Reversed position"
            ),
            TickOutcome::StopTrailed { from, to } => info!(status, %from, %to, "Stop moved"),
            TickOutcome::OrphansCancelled { count } => info!(status, count, "Orphan orders cancelled"),
            TickOutcome::ProtectionRestored { side } => info!(status, side = %side, "Protection restored"),
            TickOutcome::CooldownSuppressed { side, remaining_ms } => {
                info!(status, side = ?side, remaining_ms, "Signal in cooldown")
            }
            TickOutcome::Indeterminate | TickOutcome::NoSignal | TickOutcome::Held { .. } => {
                debug!(status, "Tick")
            }
        }
    }

    fn heartbeat(&self) {
        info!(
            symbol = %self.config.symbol,
            candles = self.series.len(),
            last_close = ?self.series.last().map(|c| c.close),
            last_status = self.last_outcome.unwrap_or("none"),
            unprotected = self.reconciler.alarm().is_some(),
            "Heartbeat"
        );
    }
}
