// src/types.rs
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Order side as the exchange understands it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

/// Direction requested by the signal layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalSide {
    Long,
    Short,
    None,
}

impl SignalSide {
    /// Side of the market order that opens a position in this direction.
    pub fn entry_side(self) -> Option<Side> {
        match self {
            SignalSide::Long => Some(Side::Buy),
            SignalSide::Short => Some(Side::Sell),
            SignalSide::None => None,
        }
    }

    pub fn as_position(self) -> PositionSide {
        match self {
            SignalSide::Long => PositionSide::Long,
            SignalSide::Short => PositionSide::Short,
            SignalSide::None => PositionSide::Flat,
        }
    }
}

/// Trend classification of a single feature row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trend {
    Long,
    Short,
    Neutral,
}

/// One OHLCV bar. Times are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub close_time: i64,
    pub is_closed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub side: SignalSide,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    /// Open time of the candle the signal was derived from.
    pub generated_at: i64,
}

impl Signal {
    pub fn none(generated_at: i64) -> Self {
        Self {
            side: SignalSide::None,
            stop_loss: None,
            take_profit: None,
            generated_at,
        }
    }
}

/// Trading constraints for one symbol. `step_size` and `tick_size` are always positive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolRules {
    pub symbol: String,
    pub step_size: Decimal,
    pub tick_size: Decimal,
    pub min_qty: Decimal,
    pub min_notional: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
    Flat,
}

impl PositionSide {
    /// Side of the reduce-only order that closes (or protects) this position.
    pub fn exit_side(self) -> Option<Side> {
        match self {
            PositionSide::Long => Some(Side::Sell),
            PositionSide::Short => Some(Side::Buy),
            PositionSide::Flat => None,
        }
    }

    pub fn matches(self, signal: SignalSide) -> bool {
        self == signal.as_position() && self != PositionSide::Flat
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
            PositionSide::Flat => write!(f, "FLAT"),
        }
    }
}

/// Net position as reported by the exchange, enriched with the protective
/// orders found on the book during the same tick.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionState {
    pub side: PositionSide,
    /// Always non-negative; direction lives in `side`.
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub active_stop_order_id: Option<String>,
    pub active_tp_order_id: Option<String>,
}

impl PositionState {
    pub fn flat() -> Self {
        Self {
            side: PositionSide::Flat,
            quantity: Decimal::ZERO,
            entry_price: Decimal::ZERO,
            active_stop_order_id: None,
            active_tp_order_id: None,
        }
    }

    /// Builds a state from a signed position amount (positive = long).
    pub fn from_signed(amount: Decimal, entry_price: Decimal) -> Self {
        let side = if amount > Decimal::ZERO {
            PositionSide::Long
        } else if amount < Decimal::ZERO {
            PositionSide::Short
        } else {
            PositionSide::Flat
        };
        Self {
            side,
            quantity: amount.abs(),
            entry_price,
            active_stop_order_id: None,
            active_tp_order_id: None,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.side == PositionSide::Flat
    }
}

/// Fresh client order id, within Binance's 36-character `[.A-Z:/a-z0-9_-]` limit.
/// Reusing one across a retry lets the exchange refuse the duplicate.
pub fn new_client_order_id() -> String {
    format!("snt-{}", Uuid::new_v4().simple())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub client_order_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    StopMarket,
    TakeProfitMarket,
    Other,
}

/// A resting order as listed by the exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenOrder {
    pub order_id: String,
    pub client_order_id: String,
    pub kind: OrderKind,
    pub side: Side,
    pub stop_price: Decimal,
    pub quantity: Decimal,
    pub reduce_only: bool,
    pub close_position: bool,
}

impl OpenOrder {
    pub fn is_protective(&self) -> bool {
        matches!(self.kind, OrderKind::StopMarket | OrderKind::TakeProfitMarket)
            && (self.reduce_only || self.close_position)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    StopLoss,
    TakeProfit,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StopQuantity {
    Quantity(Decimal),
    ClosePosition,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StopOrderRequest {
    pub symbol: String,
    pub side: Side,
    pub kind: StopKind,
    pub stop_price: Decimal,
    pub quantity: StopQuantity,
    pub reduce_only: bool,
    pub client_order_id: String,
}
