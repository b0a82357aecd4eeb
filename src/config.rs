// src/config.rs

use crate::errors::ConfigError;
use config::{Config, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// EMA/RSI trend with optional anti-chop filter.
    Trend,
    /// Score-based agreement of several independent conditions.
    Confirmation,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StrategyConfig {
    pub kind: StrategyKind,
    pub ema_fast: usize,
    pub ema_slow: usize,
    pub rsi_fast: usize,
    pub rsi_slow: usize,
    pub atr_period: usize,
    pub atr_band_mult: f64,
    pub sl_atr_mult: f64,
    pub tp_atr_mult: f64,
    /// |ema_fast - ema_slow| / close below this is treated as chop. 0 disables the filter.
    pub min_ema_spread: f64,
    /// Half-width of the pivot window; a pivot is confirmed this many candles later.
    pub pivot_window: usize,
    pub volume_period: usize,
    pub volume_spike_mult: f64,
    pub rsi_upper: f64,
    pub rsi_lower: f64,
    pub min_confirmations: u32,
    pub score_margin: u32,
}

impl StrategyConfig {
    /// Candles needed before a feature row is defined.
    pub fn warmup(&self) -> usize {
        self.ema_slow
            .max(self.ema_fast)
            .max(self.rsi_slow + 1)
            .max(self.rsi_fast + 1)
            .max(self.atr_period)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TrailingConfig {
    pub enabled: bool,
    /// Stop moves this many ATRs per adjustment.
    pub atr_step: f64,
    /// Stop never gets closer to price than this many ATRs.
    pub atr_gap: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SizingConfig {
    /// Raise undersized orders to the exchange minimum notional instead of rejecting them.
    pub bump_to_min_notional: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PaperConfig {
    pub starting_balance: Decimal,
}

#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub secret_key: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"***")
            .field("secret_key", &"***")
            .finish()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub symbol: String,
    pub interval: String,
    pub quote_asset: String,
    pub leverage: u8,
    /// Fraction of the available balance committed per entry. Required, no default.
    pub risk_fraction: Decimal,
    pub history_limit: u16,
    pub live_trading: bool,
    pub testnet: bool,
    pub heartbeat_secs: u64,
    pub request_timeout_ms: u64,
    pub read_retries: u32,
    pub confirm_attempts: u32,
    pub confirm_delay_ms: u64,
    /// Minimum distance, in ticks, between a trigger price and the market.
    pub min_stop_ticks: u32,
    pub evaluate_on_close_only: bool,
    pub cooldown_secs: u64,
    pub state_file: String,
    pub strategy: StrategyConfig,
    pub trailing: TrailingConfig,
    pub sizing: SizingConfig,
    pub paper: PaperConfig,
    #[serde(skip)]
    pub credentials: Option<Credentials>,
}

impl AppConfig {
    /// Loads `Settings.toml` (optional) and `APP_*` environment overrides,
    /// then picks up API credentials from `BINANCE_API_KEY` / `BINANCE_SECRET_KEY`.
    pub fn load() -> Result<Self, ConfigError> {
        let builder = Self::with_defaults(Config::builder())?
            .add_source(File::with_name("Settings").required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        let mut cfg: AppConfig = builder.build()?.try_deserialize()?;
        cfg.credentials = credentials_from_env();
        cfg.validate()?;
        Ok(cfg)
    }

    fn with_defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        Ok(builder
            .set_default("symbol", "BTCUSDT")?
            .set_default("interval", "1m")?
            .set_default("quote_asset", "USDT")?
            .set_default("leverage", 10)?
            .set_default("history_limit", 200)?
            .set_default("live_trading", false)?
            .set_default("testnet", true)?
            .set_default("heartbeat_secs", 30)?
            .set_default("request_timeout_ms", 5_000)?
            .set_default("read_retries", 3)?
            .set_default("confirm_attempts", 5)?
            .set_default("confirm_delay_ms", 300)?
            .set_default("min_stop_ticks", 2)?
            .set_default("evaluate_on_close_only", false)?
            .set_default("cooldown_secs", 300)?
            .set_default("state_file", "sentinel_state.json")?
            .set_default("strategy.kind", "trend")?
            .set_default("strategy.ema_fast", 9)?
            .set_default("strategy.ema_slow", 21)?
            .set_default("strategy.rsi_fast", 7)?
            .set_default("strategy.rsi_slow", 14)?
            .set_default("strategy.atr_period", 14)?
            .set_default("strategy.atr_band_mult", 1.5)?
            .set_default("strategy.sl_atr_mult", 2.0)?
            .set_default("strategy.tp_atr_mult", 5.0)?
            .set_default("strategy.min_ema_spread", 0.0)?
            .set_default("strategy.pivot_window", 3)?
            .set_default("strategy.volume_period", 20)?
            .set_default("strategy.volume_spike_mult", 1.5)?
            .set_default("strategy.rsi_upper", 55.0)?
            .set_default("strategy.rsi_lower", 45.0)?
            .set_default("strategy.min_confirmations", 2)?
            .set_default("strategy.score_margin", 1)?
            .set_default("trailing.enabled", false)?
            .set_default("trailing.atr_step", 0.5)?
            .set_default("trailing.atr_gap", 1.0)?
            .set_default("sizing.bump_to_min_notional", false)?
            .set_default("paper.starting_balance", "1000")?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        let s = &self.strategy;

        if self.symbol.trim().is_empty() {
            return invalid("symbol must not be empty".into());
        }
        if !(1..=125).contains(&self.leverage) {
            return invalid(format!("leverage {} outside 1..=125", self.leverage));
        }
        if self.risk_fraction <= Decimal::ZERO || self.risk_fraction > Decimal::ONE {
            return invalid(format!("risk_fraction {} outside (0, 1]", self.risk_fraction));
        }
        if [s.ema_fast, s.ema_slow, s.rsi_fast, s.rsi_slow, s.atr_period, s.volume_period]
            .contains(&0)
        {
            return invalid("indicator periods must be positive".into());
        }
        if s.ema_fast >= s.ema_slow {
            return invalid(format!("ema_fast {} must be below ema_slow {}", s.ema_fast, s.ema_slow));
        }
        if s.rsi_fast >= s.rsi_slow {
            return invalid(format!("rsi_fast {} must be below rsi_slow {}", s.rsi_fast, s.rsi_slow));
        }
        if s.sl_atr_mult <= 0.0 || s.sl_atr_mult >= s.tp_atr_mult {
            return invalid(format!(
                "sl_atr_mult {} must be positive and below tp_atr_mult {}",
                s.sl_atr_mult, s.tp_atr_mult
            ));
        }
        if s.rsi_lower >= s.rsi_upper {
            return invalid("rsi_lower must be below rsi_upper".into());
        }
        if s.score_margin == 0 {
            return invalid("score_margin must be at least 1".into());
        }
        if usize::from(self.history_limit) <= s.warmup() {
            return invalid(format!(
                "history_limit {} does not cover the indicator warm-up of {}",
                self.history_limit,
                s.warmup()
            ));
        }
        if self.trailing.enabled && (self.trailing.atr_step <= 0.0 || self.trailing.atr_gap < 0.0) {
            return invalid("trailing.atr_step must be positive and atr_gap non-negative".into());
        }
        if self.live_trading && self.credentials.is_none() {
            return invalid("live trading requires BINANCE_API_KEY and BINANCE_SECRET_KEY".into());
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn credentials_from_env() -> Option<Credentials> {
    let api_key = std::env::var("BINANCE_API_KEY").ok().filter(|k| !k.is_empty())?;
    let secret_key = std::env::var("BINANCE_SECRET_KEY")
        .ok()
        .filter(|k| !k.is_empty())?;
    Some(Credentials {
        api_key,
        secret_key,
    })
}
