use crate::indicators::FeatureRow;
use crate::strategies::traits::{AtrLevels, Strategy};
use crate::types::{Signal, SignalSide};

/// Votes cast by each independent condition for one candle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Score {
    pub long: u32,
    pub short: u32,
}

impl Score {
    fn vote(&mut self, long: bool, short: bool) {
        if long {
            self.long += 1;
        } else if short {
            self.short += 1;
        }
    }
}

/// Emits a side only when enough conditions agree on it and it outvotes the
/// other side by `score_margin`.
///
/// Conditions: fast EMA slope, EMA alignment, RSI threshold, volume spike in
/// the candle's direction, close beyond the last confirmed pivot.
pub struct ConfirmationStrategy {
    levels: AtrLevels,
    rsi_upper: f64,
    rsi_lower: f64,
    volume_spike_mult: f64,
    min_confirmations: u32,
    score_margin: u32,
}

impl ConfirmationStrategy {
    pub fn new(
        levels: AtrLevels,
        rsi_upper: f64,
        rsi_lower: f64,
        volume_spike_mult: f64,
        min_confirmations: u32,
        score_margin: u32,
    ) -> Self {
        Self {
            levels,
            rsi_upper,
            rsi_lower,
            volume_spike_mult,
            min_confirmations,
            score_margin,
        }
    }

    pub fn score(&self, cur: &FeatureRow, prev: Option<&FeatureRow>) -> Score {
        let mut score = Score::default();

        if let Some(prev) = prev {
            score.vote(cur.ema_fast > prev.ema_fast, cur.ema_fast < prev.ema_fast);
        }
        score.vote(cur.ema_fast > cur.ema_slow, cur.ema_fast < cur.ema_slow);
        score.vote(cur.rsi_fast > self.rsi_upper, cur.rsi_fast < self.rsi_lower);

        if let Some(avg) = cur.volume_avg {
            if avg > 0.0 && cur.volume > avg * self.volume_spike_mult {
                score.vote(cur.close > cur.open, cur.close < cur.open);
            }
        }

        let above = cur.pivot_high.is_some_and(|ph| cur.close > ph);
        let below = cur.pivot_low.is_some_and(|pl| cur.close < pl);
        score.vote(above, below);

        score
    }
}

impl Strategy for ConfirmationStrategy {
    fn name(&self) -> &'static str {
        "confirmation"
    }

    fn generate(&self, current: &FeatureRow, previous: Option<&FeatureRow>) -> Signal {
        let score = self.score(current, previous);
        let side = if score.long >= self.min_confirmations
            && score.long >= score.short + self.score_margin
        {
            SignalSide::Long
        } else if score.short >= self.min_confirmations
            && score.short >= score.long + self.score_margin
        {
            SignalSide::Short
        } else {
            SignalSide::None
        };
        self.levels.signal(side, current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::tests::row;
    use crate::types::Trend;

    fn strategy(min_confirmations: u32, margin: u32) -> ConfirmationStrategy {
        ConfirmationStrategy::new(AtrLevels::new(2.0, 5.0), 55.0, 45.0, 1.5, min_confirmations, margin)
    }

    #[test]
    fn agreeing_conditions_emit_long() {
        let prev = row(Trend::Long, 100.5, 100.0);
        let mut cur = row(Trend::Long, 101.0, 100.0);
        cur.rsi_fast = 60.0;
        let s = strategy(2, 1);
        assert_eq!(s.score(&cur, Some(&prev)), Score { long: 3, short: 0 });
        assert_eq!(s.generate(&cur, Some(&prev)).side, SignalSide::Long);
    }

    #[test]
    fn single_condition_is_not_enough() {
        let cur = row(Trend::Long, 101.0, 100.0);
        let s = strategy(2, 1);
        // only EMA alignment votes; RSI 50 is inside the band
        assert_eq!(s.score(&cur, None).long, 1);
        assert_eq!(s.generate(&cur, None).side, SignalSide::None);
    }

    #[test]
    fn split_vote_without_margin_is_none() {
        let prev = row(Trend::Short, 101.5, 100.0);
        let mut cur = row(Trend::Long, 101.0, 100.0);
        cur.rsi_fast = 40.0;
        // slope short, alignment long, rsi short -> 1 vs 2
        let s = strategy(2, 2);
        assert_eq!(s.score(&cur, Some(&prev)), Score { long: 1, short: 2 });
        assert_eq!(s.generate(&cur, Some(&prev)).side, SignalSide::None);
        // margin 1 lets the short side through
        assert_eq!(strategy(2, 1).generate(&cur, Some(&prev)).side, SignalSide::Short);
    }

    #[test]
    fn volume_spike_and_breakout_vote_with_candle_direction() {
        let mut cur = row(Trend::Short, 99.0, 100.0);
        cur.open = 101.0;
        cur.close = 97.0;
        cur.volume = 400.0;
        cur.volume_avg = Some(100.0);
        cur.pivot_low = Some(98.0);
        let s = strategy(3, 1);
        let score = s.score(&cur, None);
        assert_eq!(score, Score { long: 0, short: 3 });
        let sig = s.generate(&cur, None);
        assert_eq!(sig.side, SignalSide::Short);
        assert!(sig.stop_loss > sig.take_profit);
    }
}
