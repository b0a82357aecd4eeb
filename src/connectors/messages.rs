// src/connectors/messages.rs
use crate::types::{Candle, OpenOrder, OrderAck, OrderKind, Side, SymbolRules};
use rust_decimal::Decimal;
use serde::de::IgnoredAny;
use serde::Deserialize;

/// Kline event from wss://fstream.binance.com/ws/<symbol>@kline_<interval>
#[derive(Debug, Deserialize)]
pub struct KlineEvent {
    #[serde(rename = "e")]
    pub event_type: String, // "kline"

    #[serde(rename = "E")]
    pub event_time: i64,

    #[serde(rename = "s")]
    pub symbol: String,

    #[serde(rename = "k")]
    pub kline: KlinePayload,
}

#[derive(Debug, Deserialize)]
pub struct KlinePayload {
    #[serde(rename = "t")]
    pub open_time: i64,

    #[serde(rename = "T")]
    pub close_time: i64,

    #[serde(rename = "i")]
    pub interval: String,

    #[serde(rename = "o")]
    pub open: Decimal,

    #[serde(rename = "h")]
    pub high: Decimal,

    #[serde(rename = "l")]
    pub low: Decimal,

    #[serde(rename = "c")]
    pub close: Decimal,

    #[serde(rename = "v")]
    pub volume: Decimal,

    #[serde(rename = "x")]
    pub is_closed: bool,
}

impl From<KlinePayload> for Candle {
    fn from(k: KlinePayload) -> Self {
        Candle {
            open_time: k.open_time,
            open: k.open,
            high: k.high,
            low: k.low,
            close: k.close,
            volume: k.volume,
            close_time: k.close_time,
            is_closed: k.is_closed,
        }
    }
}

/// Row of GET /fapi/v1/klines:
/// [openTime, open, high, low, close, volume, closeTime, quoteVolume,
///  trades, takerBase, takerQuote, ignore]
#[derive(Debug, Deserialize)]
pub struct RestKline(
    pub i64,
    pub Decimal,
    pub Decimal,
    pub Decimal,
    pub Decimal,
    pub Decimal,
    pub i64,
    IgnoredAny,
    IgnoredAny,
    IgnoredAny,
    IgnoredAny,
    IgnoredAny,
);

impl RestKline {
    /// REST history is treated as closed except for a bar still running at `now_ms`.
    pub fn into_candle(self, now_ms: i64) -> Candle {
        Candle {
            open_time: self.0,
            open: self.1,
            high: self.2,
            low: self.3,
            close: self.4,
            volume: self.5,
            close_time: self.6,
            is_closed: self.6 < now_ms,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ExchangeInfo {
    pub symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    pub filters: Vec<SymbolFilter>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "filterType")]
pub enum SymbolFilter {
    #[serde(rename = "PRICE_FILTER")]
    Price {
        #[serde(rename = "tickSize")]
        tick_size: Decimal,
    },
    #[serde(rename = "LOT_SIZE")]
    LotSize {
        #[serde(rename = "stepSize")]
        step_size: Decimal,
        #[serde(rename = "minQty")]
        min_qty: Decimal,
    },
    #[serde(rename = "MIN_NOTIONAL")]
    MinNotional { notional: Decimal },
    #[serde(other)]
    Other,
}

impl SymbolInfo {
    /// Missing filters come back as zero; callers reject non-positive steps.
    pub fn to_rules(&self) -> SymbolRules {
        let mut rules = SymbolRules {
            symbol: self.symbol.clone(),
            step_size: Decimal::ZERO,
            tick_size: Decimal::ZERO,
            min_qty: Decimal::ZERO,
            min_notional: Decimal::ZERO,
        };
        for filter in &self.filters {
            match filter {
                SymbolFilter::Price { tick_size } => rules.tick_size = *tick_size,
                SymbolFilter::LotSize { step_size, min_qty } => {
                    rules.step_size = *step_size;
                    rules.min_qty = *min_qty;
                }
                SymbolFilter::MinNotional { notional } => rules.min_notional = *notional,
                SymbolFilter::Other => {}
            }
        }
        rules
    }
}

#[derive(Debug, Deserialize)]
pub struct FuturesBalance {
    pub asset: String,
    #[serde(rename = "availableBalance")]
    pub available_balance: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct PositionRisk {
    pub symbol: String,
    #[serde(rename = "positionAmt")]
    pub position_amt: Decimal,
    #[serde(rename = "entryPrice")]
    pub entry_price: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct OrderResponse {
    #[serde(rename = "orderId")]
    pub order_id: u64,
    #[serde(rename = "clientOrderId")]
    pub client_order_id: String,
    pub status: String,
}

impl From<OrderResponse> for OrderAck {
    fn from(r: OrderResponse) -> Self {
        OrderAck {
            order_id: r.order_id.to_string(),
            client_order_id: r.client_order_id,
            status: r.status,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct OpenOrderResponse {
    #[serde(rename = "orderId")]
    pub order_id: u64,
    #[serde(rename = "clientOrderId")]
    pub client_order_id: String,
    #[serde(rename = "type")]
    pub order_type: String,
    pub side: String,
    #[serde(rename = "stopPrice")]
    pub stop_price: Decimal,
    #[serde(rename = "origQty")]
    pub orig_qty: Decimal,
    #[serde(rename = "reduceOnly", default)]
    pub reduce_only: bool,
    #[serde(rename = "closePosition", default)]
    pub close_position: bool,
}

impl OpenOrderResponse {
    pub fn to_open_order(&self) -> Option<OpenOrder> {
        let side = match self.side.as_str() {
            "BUY" => Side::Buy,
            "SELL" => Side::Sell,
            _ => return None,
        };
        let kind = match self.order_type.as_str() {
            "MARKET" => OrderKind::Market,
            "STOP_MARKET" => OrderKind::StopMarket,
            "TAKE_PROFIT_MARKET" => OrderKind::TakeProfitMarket,
            _ => OrderKind::Other,
        };
        Some(OpenOrder {
            order_id: self.order_id.to_string(),
            client_order_id: self.client_order_id.clone(),
            kind,
            side,
            stop_price: self.stop_price,
            quantity: self.orig_qty,
            reduce_only: self.reduce_only,
            close_position: self.close_position,
        })
    }
}

/// Error body returned with non-2xx statuses.
#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
    pub code: i64,
    pub msg: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parses_kline_stream_event() {
        let raw = r#"{"e":"kline","E":1700000060000,"s":"BTCUSDT","k":{"t":1700000000000,"T":1700000059999,"s":"BTCUSDT","i":"1m","f":100,"L":200,"o":"37000.10","c":"37010.00","h":"37020.50","l":"36990.00","v":"12.345","n":100,"x":false,"q":"456789.1","V":"6.1","Q":"225000.0","B":"0"}}"#;
        let event: KlineEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.symbol, "BTCUSDT");
        let candle: Candle = event.kline.into();
        assert_eq!(candle.open_time, 1_700_000_000_000);
        assert_eq!(candle.high, dec!(37020.50));
        assert_eq!(candle.volume, dec!(12.345));
        assert!(!candle.is_closed);
    }

    #[test]
    fn parses_rest_kline_row() {
        let raw = r#"[[1700000000000,"100.0","101.5","99.5","101.0","250.5",1700000059999,"25000.0",42,"120.0","12000.0","0"]]"#;
        let rows: Vec<RestKline> = serde_json::from_str(raw).unwrap();
        let candle = rows.into_iter().next().unwrap().into_candle(1_700_000_100_000);
        assert_eq!(candle.close, dec!(101.0));
        assert_eq!(candle.close_time, 1_700_000_059_999);
        assert!(candle.is_closed);
    }

    #[test]
    fn extracts_symbol_rules_from_filters() {
        let raw = r#"{"symbols":[{"symbol":"BTCUSDT","filters":[
            {"filterType":"PRICE_FILTER","minPrice":"556.80","maxPrice":"4529764","tickSize":"0.10"},
            {"filterType":"LOT_SIZE","maxQty":"1000","minQty":"0.001","stepSize":"0.001"},
            {"filterType":"MARKET_LOT_SIZE","maxQty":"120","minQty":"0.001","stepSize":"0.001"},
            {"filterType":"MIN_NOTIONAL","notional":"100"}]}]}"#;
        let info: ExchangeInfo = serde_json::from_str(raw).unwrap();
        let rules = info.symbols[0].to_rules();
        assert_eq!(rules.tick_size, dec!(0.10));
        assert_eq!(rules.step_size, dec!(0.001));
        assert_eq!(rules.min_qty, dec!(0.001));
        assert_eq!(rules.min_notional, dec!(100));
    }

    #[test]
    fn maps_open_orders() {
        let raw = r#"{"orderId":8886774,"clientOrderId":"abc","type":"STOP_MARKET","side":"SELL","stopPrice":"36500.0","origQty":"0.010","reduceOnly":true,"closePosition":false,"status":"NEW"}"#;
        let resp: OpenOrderResponse = serde_json::from_str(raw).unwrap();
        let order = resp.to_open_order().unwrap();
        assert_eq!(order.kind, OrderKind::StopMarket);
        assert_eq!(order.side, Side::Sell);
        assert!(order.is_protective());
    }

    #[test]
    fn parses_error_body() {
        let body: ApiErrorBody =
            serde_json::from_str(r#"{"code":-2021,"msg":"Order would immediately trigger."}"#).unwrap();
        assert_eq!(body.code, -2021);
    }
}
