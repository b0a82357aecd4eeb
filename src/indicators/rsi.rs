use super::IndicatorError;
use ta::indicators::SimpleMovingAverage;
use ta::Next;

/// Relative Strength Index over rolling means of up and down moves.
///
/// Needs `period` price changes (so `period + 1` closes) before it is defined.
/// A window with no down moves reads 100 instead of dividing by zero.
#[derive(Debug, Clone)]
pub struct RollingRsi {
    period: usize,
    prev_close: Option<f64>,
    avg_up: SimpleMovingAverage,
    avg_down: SimpleMovingAverage,
    changes: usize,
}

impl RollingRsi {
    pub fn new(period: usize) -> Result<Self, IndicatorError> {
        let sma = || SimpleMovingAverage::new(period).map_err(|_| IndicatorError::InvalidPeriod("rsi"));
        Ok(Self {
            period,
            prev_close: None,
            avg_up: sma()?,
            avg_down: sma()?,
            changes: 0,
        })
    }
}

impl Next<f64> for RollingRsi {
    type Output = Option<f64>;

    fn next(&mut self, close: f64) -> Option<f64> {
        let prev = self.prev_close.replace(close)?;
        let delta = close - prev;
        let up = self.avg_up.next(delta.max(0.0));
        let down = self.avg_down.next((-delta).max(0.0));
        self.changes += 1;

        if self.changes < self.period {
            return None;
        }
        Some(rsi_from_means(up, down))
    }
}

pub fn rsi_from_means(avg_up: f64, avg_down: f64) -> f64 {
    if avg_down <= 0.0 {
        return 100.0;
    }
    (100.0 - 100.0 / (1.0 + avg_up / avg_down)).clamp(0.0, 100.0)
}
