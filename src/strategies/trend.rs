use crate::indicators::FeatureRow;
use crate::strategies::traits::{AtrLevels, Strategy};
use crate::types::{Signal, SignalSide, Trend};

/// Follows the EMA/RSI trend classification directly.
pub struct TrendFollower {
    levels: AtrLevels,
    min_ema_spread: f64,
}

impl TrendFollower {
    /// Creates a new TrendFollower strategy.
    ///
    /// # Arguments
    /// * `levels` - ATR multipliers for stop-loss and take-profit.
    /// * `min_ema_spread` - Minimum |ema_fast - ema_slow| / close; below it the
    ///   market is treated as ranging and no signal is emitted (0 disables).
    pub fn new(levels: AtrLevels, min_ema_spread: f64) -> Self {
        Self {
            levels,
            min_ema_spread,
        }
    }

    fn is_choppy(&self, row: &FeatureRow) -> bool {
        if self.min_ema_spread <= 0.0 || row.close <= 0.0 {
            return false;
        }
        (row.ema_fast - row.ema_slow).abs() / row.close < self.min_ema_spread
    }
}

impl Strategy for TrendFollower {
    fn name(&self) -> &'static str {
        "trend"
    }

    fn generate(&self, current: &FeatureRow, _previous: Option<&FeatureRow>) -> Signal {
        let side = match current.trend {
            Trend::Long => SignalSide::Long,
            Trend::Short => SignalSide::Short,
            Trend::Neutral => return Signal::none(current.open_time),
        };
        if self.is_choppy(current) {
            return Signal::none(current.open_time);
        }
        self.levels.signal(side, current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::tests::row;
    use rust_decimal_macros::dec;

    #[test]
    fn long_trend_gives_long_with_atr_levels() {
        let s = TrendFollower::new(AtrLevels::new(2.0, 5.0), 0.0);
        let r = row(Trend::Long, 101.0, 100.0);
        let sig = s.generate(&r, None);
        assert_eq!(sig.side, SignalSide::Long);
        // low 99, high 101, atr 1
        assert_eq!(sig.stop_loss, Some(dec!(97)));
        assert_eq!(sig.take_profit, Some(dec!(106)));
        assert_eq!(sig.generated_at, r.open_time);
    }

    #[test]
    fn short_levels_are_mirrored() {
        let s = TrendFollower::new(AtrLevels::new(2.0, 5.0), 0.0);
        let sig = s.generate(&row(Trend::Short, 99.0, 100.0), None);
        assert_eq!(sig.side, SignalSide::Short);
        assert_eq!(sig.stop_loss, Some(dec!(103)));
        assert_eq!(sig.take_profit, Some(dec!(94)));
    }

    #[test]
    fn neutral_gives_nothing() {
        let s = TrendFollower::new(AtrLevels::new(2.0, 5.0), 0.0);
        let sig = s.generate(&row(Trend::Neutral, 100.0, 100.0), None);
        assert_eq!(sig.side, SignalSide::None);
        assert_eq!(sig.stop_loss, None);
    }

    #[test]
    fn chop_filter_suppresses_narrow_spread() {
        let s = TrendFollower::new(AtrLevels::new(2.0, 5.0), 0.01);
        // spread 0.1 / close 100 = 0.001 < 0.01
        let sig = s.generate(&row(Trend::Long, 100.1, 100.0), None);
        assert_eq!(sig.side, SignalSide::None);
        // spread 2 / 100 = 0.02 passes
        let sig = s.generate(&row(Trend::Long, 102.0, 100.0), None);
        assert_eq!(sig.side, SignalSide::Long);
    }

    #[test]
    fn output_is_deterministic() {
        let s = TrendFollower::new(AtrLevels::new(2.0, 5.0), 0.0);
        let r = row(Trend::Long, 101.0, 100.0);
        assert_eq!(s.generate(&r, None), s.generate(&r, None));
    }
}
