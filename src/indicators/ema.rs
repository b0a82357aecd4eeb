use super::IndicatorError;
use ta::Next;

/// Exponential moving average seeded with the simple mean of the first `period` values.
///
/// bar < period-1  -> None
/// bar == period-1 -> mean(values[0..period])
/// bar >= period   -> value*k + prev*(1-k), k = 2/(period+1)
#[derive(Debug, Clone)]
pub struct Ema {
    period: usize,
    k: f64,
    seed_sum: f64,
    count: usize,
    value: Option<f64>,
}

impl Ema {
    pub fn new(period: usize) -> Result<Self, IndicatorError> {
        if period == 0 {
            return Err(IndicatorError::InvalidPeriod("ema"));
        }
        Ok(Self {
            period,
            k: 2.0 / (period as f64 + 1.0),
            seed_sum: 0.0,
            count: 0,
            value: None,
        })
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

impl Next<f64> for Ema {
    type Output = Option<f64>;

    fn next(&mut self, input: f64) -> Option<f64> {
        self.count += 1;
        self.value = match self.value {
            Some(prev) => Some(input * self.k + prev * (1.0 - self.k)),
            None => {
                self.seed_sum += input;
                (self.count == self.period).then(|| self.seed_sum / self.period as f64)
            }
        };
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(period: usize, values: &[f64]) -> Vec<Option<f64>> {
        let mut ema = Ema::new(period).unwrap();
        values.iter().map(|v| ema.next(*v)).collect()
    }

    #[test]
    fn warmup_is_indeterminate() {
        let out = run(3, &[10.0, 11.0, 12.0, 13.0]);
        assert_eq!(out[0], None);
        assert_eq!(out[1], None);
        assert!(out[2].is_some());
    }

    #[test]
    fn seeds_with_simple_mean() {
        let out = run(3, &[10.0, 11.0, 12.0]);
        assert!((out[2].unwrap() - 11.0).abs() < 1e-12);
    }

    #[test]
    fn follows_recurrence_after_seed() {
        let closes = [10.0, 11.0, 12.0, 13.0, 9.0, 15.5];
        let out = run(3, &closes);
        let k = 2.0 / 4.0;
        for i in 3..closes.len() {
            let expected = closes[i] * k + out[i - 1].unwrap() * (1.0 - k);
            assert!((out[i].unwrap() - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn period_one_tracks_input() {
        let out = run(1, &[5.0, 7.0]);
        assert_eq!(out, vec![Some(5.0), Some(7.0)]);
    }

    #[test]
    fn zero_period_is_rejected() {
        assert!(Ema::new(0).is_err());
    }
}
