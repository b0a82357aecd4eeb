use super::IndicatorError;
use ta::indicators::{SimpleMovingAverage, TrueRange};
use ta::{Close, High, Low, Next};

/// Average True Range as a plain rolling mean of true ranges.
///
/// The first bar has no previous close, so its true range is `high - low`.
#[derive(Debug, Clone)]
pub struct RollingAtr {
    period: usize,
    true_range: TrueRange,
    mean: SimpleMovingAverage,
    count: usize,
}

impl RollingAtr {
    pub fn new(period: usize) -> Result<Self, IndicatorError> {
        Ok(Self {
            period,
            true_range: TrueRange::new(),
            mean: SimpleMovingAverage::new(period)
                .map_err(|_| IndicatorError::InvalidPeriod("atr"))?,
            count: 0,
        })
    }
}

impl<T: High + Low + Close> Next<&T> for RollingAtr {
    type Output = Option<f64>;

    fn next(&mut self, bar: &T) -> Option<f64> {
        let tr = self.true_range.next(bar);
        let atr = self.mean.next(tr);
        self.count += 1;
        (self.count >= self.period).then_some(atr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ta::DataItem;

    fn bar(high: f64, low: f64, close: f64) -> DataItem {
        DataItem::builder()
            .open(close)
            .high(high)
            .low(low)
            .close(close)
            .volume(1.0)
            .build()
            .unwrap()
    }

    #[test]
    fn constant_range_gives_range() {
        let mut atr = RollingAtr::new(3).unwrap();
        let out: Vec<_> = (0..5).map(|_| atr.next(&bar(101.0, 99.0, 100.0))).collect();
        assert_eq!(out[1], None);
        assert!((out[2].unwrap() - 2.0).abs() < 1e-12);
        assert!((out[4].unwrap() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn gaps_use_previous_close() {
        let mut atr = RollingAtr::new(2).unwrap();
        atr.next(&bar(101.0, 99.0, 100.0)); // tr = 2
        // gap up: high-low = 1, |high - prev_close| = 11
        let v = atr.next(&bar(111.0, 110.0, 110.5)).unwrap();
        assert!((v - (2.0 + 11.0) / 2.0).abs() < 1e-12);
    }
}
