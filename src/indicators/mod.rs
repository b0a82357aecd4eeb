// Technical indicators feeding the signal layer.
// EMA pair, RSI pair, ATR with bands, confirmed pivots, volume mean.

pub mod atr;
pub mod ema;
pub mod features;
pub mod pivots;
pub mod rsi;

pub use atr::RollingAtr;
pub use ema::Ema;
pub use features::{classify_trend, compute_features, FeatureBuilder, FeatureRow, FeatureWindow};
pub use pivots::PivotDetector;
pub use rsi::RollingRsi;

use crate::types::Candle;
use rust_decimal::prelude::ToPrimitive;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum IndicatorError {
    #[error("{0} period must be positive")]
    InvalidPeriod(&'static str),
}

impl ta::Open for Candle {
    fn open(&self) -> f64 {
        self.open.to_f64().unwrap_or_default()
    }
}

impl ta::High for Candle {
    fn high(&self) -> f64 {
        self.high.to_f64().unwrap_or_default()
    }
}

impl ta::Low for Candle {
    fn low(&self) -> f64 {
        self.low.to_f64().unwrap_or_default()
    }
}

impl ta::Close for Candle {
    fn close(&self) -> f64 {
        self.close.to_f64().unwrap_or_default()
    }
}

impl ta::Volume for Candle {
    fn volume(&self) -> f64 {
        self.volume.to_f64().unwrap_or_default()
    }
}
