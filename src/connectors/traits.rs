use crate::errors::ExchangeError;
use crate::types::{Candle, OpenOrder, OrderAck, PositionState, Side, StopOrderRequest, SymbolRules};
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::mpsc;

#[async_trait]
pub trait StreamClient: Send + Sync {
    /// Spawns a task that forwards every kline update (open or closed) to `sender`.
    async fn subscribe_klines(
        &mut self,
        symbol: &str,
        interval: &str,
        sender: mpsc::Sender<Candle>,
    ) -> Result<()>;
}

#[async_trait]
pub trait MarketData: Send + Sync {
    /// Most recent `limit` candles, oldest first.
    async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u16,
    ) -> Result<Vec<Candle>, ExchangeError>;

    async fn get_symbol_rules(&self, symbol: &str) -> Result<SymbolRules, ExchangeError>;
}

#[async_trait]
pub trait ExecutionHandler: Send + Sync {
    async fn set_leverage(&self, symbol: &str, leverage: u8) -> Result<(), ExchangeError>;

    async fn get_balance(&self, asset: &str) -> Result<Decimal, ExchangeError>;

    /// Net position; order ids are left empty.
    async fn get_position(&self, symbol: &str) -> Result<PositionState, ExchangeError>;

    async fn place_market_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        reduce_only: bool,
        client_order_id: &str,
    ) -> Result<OrderAck, ExchangeError>;

    async fn place_stop_order(&self, request: &StopOrderRequest) -> Result<OrderAck, ExchangeError>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError>;

    async fn cancel_all_open_orders(&self, symbol: &str) -> Result<(), ExchangeError>;

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError>;

    /// Looks an order up by the client id it was sent with. `None` means the
    /// exchange has no record of it.
    async fn query_order(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> Result<Option<OrderAck>, ExchangeError>;

    // Simulated venues fill at the last price they were shown; real ones ignore it.
    fn observe_price(&self, _symbol: &str, _price: Decimal) {}
}
