use super::{Ema, IndicatorError, PivotDetector, RollingAtr, RollingRsi};
use crate::config::StrategyConfig;
use crate::types::{Candle, Trend};
use ta::indicators::SimpleMovingAverage;
use ta::{Close, High, Low, Next, Open, Volume};

/// Derived values for one candle. Only produced once every indicator is warm.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub ema_fast: f64,
    pub ema_slow: f64,
    pub rsi_fast: f64,
    pub rsi_slow: f64,
    pub atr: f64,
    pub upper_band: f64,
    pub lower_band: f64,
    pub trend: Trend,
    pub volume_avg: Option<f64>,
    pub pivot_high: Option<f64>,
    pub pivot_low: Option<f64>,
}

/// LONG when both the EMA pair and the RSI pair point up, SHORT when both
/// point down, NEUTRAL otherwise (including exact ties).
pub fn classify_trend(ema_fast: f64, ema_slow: f64, rsi_fast: f64, rsi_slow: f64) -> Trend {
    if ema_fast > ema_slow && rsi_fast > rsi_slow {
        Trend::Long
    } else if ema_fast < ema_slow && rsi_fast < rsi_slow {
        Trend::Short
    } else {
        Trend::Neutral
    }
}

/// Streaming feature computation, one candle at a time.
#[derive(Debug, Clone)]
pub struct FeatureBuilder {
    ema_fast: Ema,
    ema_slow: Ema,
    rsi_fast: RollingRsi,
    rsi_slow: RollingRsi,
    atr: RollingAtr,
    volume_mean: SimpleMovingAverage,
    volume_period: usize,
    volume_seen: usize,
    pivots: PivotDetector,
    band_mult: f64,
}

impl FeatureBuilder {
    pub fn new(cfg: &StrategyConfig) -> Result<Self, IndicatorError> {
        Ok(Self {
            ema_fast: Ema::new(cfg.ema_fast)?,
            ema_slow: Ema::new(cfg.ema_slow)?,
            rsi_fast: RollingRsi::new(cfg.rsi_fast)?,
            rsi_slow: RollingRsi::new(cfg.rsi_slow)?,
            atr: RollingAtr::new(cfg.atr_period)?,
            volume_mean: SimpleMovingAverage::new(cfg.volume_period)
                .map_err(|_| IndicatorError::InvalidPeriod("volume"))?,
            volume_period: cfg.volume_period,
            volume_seen: 0,
            pivots: PivotDetector::new(cfg.pivot_window),
            band_mult: cfg.atr_band_mult,
        })
    }

    pub fn next(&mut self, candle: &Candle) -> Option<FeatureRow> {
        let close = candle.close();
        // every indicator sees every candle, warm or not
        let ema_fast = self.ema_fast.next(close);
        let ema_slow = self.ema_slow.next(close);
        let rsi_fast = self.rsi_fast.next(close);
        let rsi_slow = self.rsi_slow.next(close);
        let atr = self.atr.next(candle);
        let volume_avg = self.volume_mean.next(candle.volume());
        self.volume_seen += 1;
        let (pivot_high, pivot_low) = self.pivots.next(candle.high(), candle.low());

        let (Some(ema_fast), Some(ema_slow), Some(rsi_fast), Some(rsi_slow), Some(atr)) =
            (ema_fast, ema_slow, rsi_fast, rsi_slow, atr)
        else {
            return None;
        };

        Some(FeatureRow {
            open_time: candle.open_time,
            open: candle.open(),
            high: candle.high(),
            low: candle.low(),
            close,
            volume: candle.volume(),
            ema_fast,
            ema_slow,
            rsi_fast,
            rsi_slow,
            atr,
            upper_band: close + atr * self.band_mult,
            lower_band: close - atr * self.band_mult,
            trend: classify_trend(ema_fast, ema_slow, rsi_fast, rsi_slow),
            volume_avg: (self.volume_seen >= self.volume_period).then_some(volume_avg),
            pivot_high,
            pivot_low,
        })
    }
}

/// Full pass over a candle window. Entry `i` is `None` while indicators warm up.
pub fn compute_features(
    candles: &[Candle],
    cfg: &StrategyConfig,
) -> Result<Vec<Option<FeatureRow>>, IndicatorError> {
    let mut builder = FeatureBuilder::new(cfg)?;
    Ok(candles.iter().map(|c| builder.next(c)).collect())
}

/// The two most recent feature rows of a window.
#[derive(Debug, Clone, Default)]
pub struct FeatureWindow {
    pub current: Option<FeatureRow>,
    pub previous: Option<FeatureRow>,
}

impl FeatureWindow {
    pub fn from_candles(candles: &[Candle], cfg: &StrategyConfig) -> Result<Self, IndicatorError> {
        let mut rows = compute_features(candles, cfg)?;
        let current = rows.pop().flatten();
        let previous = rows.pop().flatten();
        Ok(Self { current, previous })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use rust_decimal::Decimal;

    pub fn candle(i: i64, close: f64) -> Candle {
        let c = Decimal::try_from(close).unwrap();
        Candle {
            open_time: i * 60_000,
            open: c,
            high: c + Decimal::ONE,
            low: c - Decimal::ONE,
            close: c,
            volume: Decimal::from(100),
            close_time: i * 60_000 + 59_999,
            is_closed: true,
        }
    }

    pub fn rising(n: usize) -> Vec<Candle> {
        (0..n).map(|i| candle(i as i64, 100.0 + i as f64 * 0.5)).collect()
    }

    #[test]
    fn ties_are_neutral() {
        assert_eq!(classify_trend(2.0, 1.0, 60.0, 50.0), Trend::Long);
        assert_eq!(classify_trend(1.0, 2.0, 40.0, 50.0), Trend::Short);
        assert_eq!(classify_trend(2.0, 1.0, 40.0, 50.0), Trend::Neutral);
        assert_eq!(classify_trend(1.0, 1.0, 60.0, 50.0), Trend::Neutral);
        assert_eq!(classify_trend(2.0, 1.0, 50.0, 50.0), Trend::Neutral);
    }

    #[test]
    fn rows_are_indeterminate_until_warm() {
        let cfg = test_config().strategy;
        let rows = compute_features(&rising(30), &cfg).unwrap();
        let warm = cfg.warmup();
        assert!(rows[..warm - 1].iter().all(Option::is_none));
        assert!(rows[warm - 1..].iter().all(Option::is_some));
    }

    #[test]
    fn steady_rise_is_long_with_bands_around_close() {
        let cfg = test_config().strategy;
        let mut candles = rising(40);
        // a single dip keeps avg_down positive so the RSI pair can separate
        candles[30] = candle(30, 110.0);
        let window = FeatureWindow::from_candles(&candles, &cfg).unwrap();
        let row = window.current.unwrap();
        assert!(row.ema_fast > row.ema_slow);
        assert!(row.upper_band > row.close && row.lower_band < row.close);
        assert!(window.previous.is_some());
    }

    #[test]
    fn streaming_matches_batch() {
        let cfg = test_config().strategy;
        let candles = rising(50);
        let batch = compute_features(&candles, &cfg).unwrap();
        let mut builder = FeatureBuilder::new(&cfg).unwrap();
        for (c, expected) in candles.iter().zip(batch) {
            assert_eq!(builder.next(c), expected);
        }
    }

    #[test]
    fn short_window_has_no_current_row() {
        let cfg = test_config().strategy;
        let window = FeatureWindow::from_candles(&rising(5), &cfg).unwrap();
        assert!(window.current.is_none());
    }
}
