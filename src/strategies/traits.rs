// src/strategies/traits.rs
use crate::indicators::FeatureRow;
use crate::types::{Signal, SignalSide};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

/// Turns feature rows into a trade signal.
///
/// Implementations must be pure: the same rows always give the same signal.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// `previous` is the row before `current`, when it is warm.
    fn generate(&self, current: &FeatureRow, previous: Option<&FeatureRow>) -> Signal;
}

/// Stop-loss / take-profit placement from the latest ATR.
///
/// LONG:  sl = low  - atr * sl_mult, tp = high + atr * tp_mult
/// SHORT: sl = high + atr * sl_mult, tp = low  - atr * tp_mult
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AtrLevels {
    pub sl_mult: f64,
    pub tp_mult: f64,
}

impl AtrLevels {
    pub fn new(sl_mult: f64, tp_mult: f64) -> Self {
        Self { sl_mult, tp_mult }
    }

    /// Returns (stop_loss, take_profit); `None` for a non-directional side or
    /// a non-finite value.
    pub fn levels(&self, side: SignalSide, row: &FeatureRow) -> Option<(Decimal, Decimal)> {
        let (sl, tp) = match side {
            SignalSide::Long => (
                row.low - row.atr * self.sl_mult,
                row.high + row.atr * self.tp_mult,
            ),
            SignalSide::Short => (
                row.high + row.atr * self.sl_mult,
                row.low - row.atr * self.tp_mult,
            ),
            SignalSide::None => return None,
        };
        Some((Decimal::from_f64(sl)?, Decimal::from_f64(tp)?))
    }

    pub fn signal(&self, side: SignalSide, row: &FeatureRow) -> Signal {
        match self.levels(side, row) {
            Some((sl, tp)) => Signal {
                side,
                stop_loss: Some(sl),
                take_profit: Some(tp),
                generated_at: row.open_time,
            },
            None => Signal::none(row.open_time),
        }
    }
}
