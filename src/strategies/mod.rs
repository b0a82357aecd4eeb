pub mod confirmation;
pub mod traits;
pub mod trend;

pub use confirmation::ConfirmationStrategy;
pub use traits::{AtrLevels, Strategy};
pub use trend::TrendFollower;

use crate::config::{StrategyConfig, StrategyKind};

pub fn from_config(cfg: &StrategyConfig) -> Box<dyn Strategy> {
    let levels = AtrLevels::new(cfg.sl_atr_mult, cfg.tp_atr_mult);
    match cfg.kind {
        StrategyKind::Trend => Box::new(TrendFollower::new(levels, cfg.min_ema_spread)),
        StrategyKind::Confirmation => Box::new(ConfirmationStrategy::new(
            levels,
            cfg.rsi_upper,
            cfg.rsi_lower,
            cfg.volume_spike_mult,
            cfg.min_confirmations,
            cfg.score_margin,
        )),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use crate::indicators::FeatureRow;
    use crate::types::Trend;

    /// Row at close 100 (high 101, low 99), ATR 1, neutral RSI.
    pub fn row(trend: Trend, ema_fast: f64, ema_slow: f64) -> FeatureRow {
        FeatureRow {
            open_time: 1_700_000_000_000,
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.0,
            volume: 100.0,
            ema_fast,
            ema_slow,
            rsi_fast: 50.0,
            rsi_slow: 50.0,
            atr: 1.0,
            upper_band: 101.5,
            lower_band: 98.5,
            trend,
            volume_avg: None,
            pivot_high: None,
            pivot_low: None,
        }
    }
}
