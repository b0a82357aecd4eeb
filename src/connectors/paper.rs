// src/connectors/paper.rs
use crate::connectors::traits::{ExecutionHandler, MarketData};
use crate::errors::ExchangeError;
use crate::types::{
    Candle, OpenOrder, OrderAck, OrderKind, PositionState, Side, StopKind, StopOrderRequest,
    StopQuantity, SymbolRules,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tracing::info;

/// Exchange operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaperOp {
    SetLeverage,
    GetBalance,
    GetPosition,
    MarketOrder,
    StopOrder,
    CancelOrder,
    CancelAll,
    GetOpenOrders,
    QueryOrder,
}

/// One call as it reached the paper venue.
#[derive(Debug, Clone, PartialEq)]
pub enum PaperCall {
    SetLeverage(u8),
    GetBalance,
    GetPosition,
    MarketOrder {
        side: Side,
        quantity: Decimal,
        reduce_only: bool,
    },
    StopOrder {
        kind: StopKind,
        side: Side,
        stop_price: Decimal,
    },
    CancelOrder(String),
    CancelAll,
    GetOpenOrders,
    QueryOrder(String),
}

impl PaperCall {
    pub fn is_mutating(&self) -> bool {
        !matches!(
            self,
            PaperCall::GetBalance
                | PaperCall::GetPosition
                | PaperCall::GetOpenOrders
                | PaperCall::QueryOrder(_)
        )
    }
}

#[derive(Debug, Clone)]
enum Fault {
    /// Fails without touching the book.
    Before(ExchangeError),
    /// Applies the call, then reports failure (lost acknowledgement).
    After(ExchangeError),
    /// Never answers; the call does not reach the book.
    Stall,
}

#[derive(Debug)]
struct PaperBook {
    balance: Decimal,
    position: Decimal,
    entry_price: Decimal,
    mark_price: Decimal,
    orders: Vec<OpenOrder>,
    /// Every accepted order by client id, with its latest status.
    history: HashMap<String, OrderAck>,
    /// Client id of every stop order sent, accepted or not.
    stop_client_ids: Vec<String>,
    next_id: u64,
    faults: HashMap<PaperOp, VecDeque<Fault>>,
    journal: Vec<PaperCall>,
}

impl PaperBook {
    fn take_fault(&mut self, op: PaperOp) -> Option<Fault> {
        self.faults.get_mut(&op).and_then(VecDeque::pop_front)
    }

    fn next_order_id(&mut self) -> String {
        self.next_id += 1;
        self.next_id.to_string()
    }

    fn accept(&mut self, client_order_id: &str, status: &str) -> Result<OrderAck, ExchangeError> {
        if self.history.contains_key(client_order_id) {
            return Err(ExchangeError::Rejected {
                code: -4116,
                msg: "ClientOrderId is duplicated.".into(),
            });
        }
        let ack = OrderAck {
            order_id: self.next_order_id(),
            client_order_id: client_order_id.to_string(),
            status: status.to_string(),
        };
        self.history.insert(ack.client_order_id.clone(), ack.clone());
        Ok(ack)
    }

    fn settle(&mut self, order: &OpenOrder, status: &str) {
        if let Some(ack) = self.history.get_mut(&order.client_order_id) {
            ack.status = status.to_string();
        }
    }

    /// Applies a signed fill at the mark price, realizing PnL on the reduced part.
    fn fill(&mut self, signed_qty: Decimal) {
        let price = self.mark_price;
        let old = self.position;
        let new = old + signed_qty;

        if old.is_zero() || old.is_sign_positive() == signed_qty.is_sign_positive() {
            let total = old.abs() + signed_qty.abs();
            if !total.is_zero() {
                self.entry_price = (self.entry_price * old.abs() + price * signed_qty.abs()) / total;
            }
        } else {
            let closed = old.abs().min(signed_qty.abs());
            let direction = if old.is_sign_positive() { Decimal::ONE } else { -Decimal::ONE };
            self.balance += (price - self.entry_price) * closed * direction;
            if new.is_zero() {
                self.entry_price = Decimal::ZERO;
            } else if new.is_sign_positive() != old.is_sign_positive() {
                self.entry_price = price;
            }
        }
        self.position = new;
    }

    fn triggered(&self, order: &OpenOrder) -> bool {
        let mark = self.mark_price;
        match (order.kind, order.side) {
            (OrderKind::StopMarket, Side::Sell) | (OrderKind::TakeProfitMarket, Side::Buy) => {
                mark <= order.stop_price
            }
            (OrderKind::StopMarket, Side::Buy) | (OrderKind::TakeProfitMarket, Side::Sell) => {
                mark >= order.stop_price
            }
            _ => false,
        }
    }
}

/// In-memory single-symbol venue: market orders fill at the mark price,
/// reduce-only triggers fire when the mark crosses them.
pub struct PaperExchange {
    rules: SymbolRules,
    book: Mutex<PaperBook>,
    candles: Mutex<Vec<Candle>>,
}

impl PaperExchange {
    pub fn new(rules: SymbolRules, starting_balance: Decimal) -> Self {
        Self {
            rules,
            book: Mutex::new(PaperBook {
                balance: starting_balance,
                position: Decimal::ZERO,
                entry_price: Decimal::ZERO,
                mark_price: Decimal::ZERO,
                orders: Vec::new(),
                history: HashMap::new(),
                stop_client_ids: Vec::new(),
                next_id: 0,
                faults: HashMap::new(),
                journal: Vec::new(),
            }),
            candles: Mutex::new(Vec::new()),
        }
    }

    fn book(&self) -> MutexGuard<'_, PaperBook> {
        // a poisoned lock only means a test thread panicked mid-call
        self.book.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Moves the mark price and fires any crossed triggers.
    pub fn set_mark_price(&self, price: Decimal) {
        let mut book = self.book();
        book.mark_price = price;

        let pending = std::mem::take(&mut book.orders);
        let mut resting = Vec::with_capacity(pending.len());
        for order in pending {
            if book.position.is_zero() || !book.triggered(&order) {
                resting.push(order);
                continue;
            }
            let qty = if order.close_position {
                book.position.abs()
            } else {
                order.quantity.min(book.position.abs())
            };
            let signed = match order.side {
                Side::Buy => qty,
                Side::Sell => -qty,
            };
            info!(order_id = %order.order_id, kind = ?order.kind, %price, "Paper trigger fired");
            book.fill(signed);
            book.settle(&order, "FILLED");
        }
        book.orders = resting;
    }

    /// Overwrites the position, as if someone traded on the account by hand.
    pub fn force_position(&self, signed_qty: Decimal, entry_price: Decimal) {
        let mut book = self.book();
        book.position = signed_qty;
        book.entry_price = entry_price;
    }

    pub fn fail_next(&self, op: PaperOp, error: ExchangeError) {
        self.book().faults.entry(op).or_default().push_back(Fault::Before(error));
    }

    pub fn fail_after_apply(&self, op: PaperOp, error: ExchangeError) {
        self.book().faults.entry(op).or_default().push_back(Fault::After(error));
    }

    /// The next call of `op` hangs forever.
    pub fn stall_next(&self, op: PaperOp) {
        self.book().faults.entry(op).or_default().push_back(Fault::Stall);
    }

    pub fn set_klines(&self, candles: Vec<Candle>) {
        *self.candles.lock().unwrap_or_else(|e| e.into_inner()) = candles;
    }

    pub fn journal(&self) -> Vec<PaperCall> {
        self.book().journal.clone()
    }

    pub fn mutating_calls(&self) -> Vec<PaperCall> {
        self.book().journal.iter().filter(|c| c.is_mutating()).cloned().collect()
    }

    pub fn stop_client_ids(&self) -> Vec<String> {
        self.book().stop_client_ids.clone()
    }

    pub fn clear_journal(&self) {
        self.book().journal.clear();
    }

    pub fn position(&self) -> Decimal {
        self.book().position
    }

    pub fn balance(&self) -> Decimal {
        self.book().balance
    }

    pub fn resting_orders(&self) -> Vec<OpenOrder> {
        self.book().orders.clone()
    }

    fn check_symbol(&self, symbol: &str) -> Result<(), ExchangeError> {
        if symbol == self.rules.symbol {
            Ok(())
        } else {
            Err(ExchangeError::UnknownSymbol(symbol.to_string()))
        }
    }

    /// Hangs if a stall is queued for `op`.
    async fn stall_if_armed(&self, op: PaperOp) {
        let armed = {
            let mut book = self.book();
            let armed = matches!(book.faults.get(&op).and_then(VecDeque::front), Some(Fault::Stall));
            if armed {
                book.take_fault(op);
            }
            armed
        };
        if armed {
            std::future::pending::<()>().await;
        }
    }

    /// Records the call, then runs `apply` unless a fault says otherwise.
    fn execute<T>(
        &self,
        op: PaperOp,
        call: PaperCall,
        apply: impl FnOnce(&mut PaperBook) -> Result<T, ExchangeError>,
    ) -> Result<T, ExchangeError> {
        let mut book = self.book();
        book.journal.push(call);
        match book.take_fault(op) {
            Some(Fault::Before(e)) => Err(e),
            Some(Fault::Stall) => Err(ExchangeError::Network("stalled call".into())),
            Some(Fault::After(e)) => {
                apply(&mut *book)?;
                Err(e)
            }
            None => apply(&mut *book),
        }
    }
}

#[async_trait]
impl MarketData for PaperExchange {
    async fn get_klines(
        &self,
        symbol: &str,
        _interval: &str,
        limit: u16,
    ) -> Result<Vec<Candle>, ExchangeError> {
        self.check_symbol(symbol)?;
        let candles = self.candles.lock().unwrap_or_else(|e| e.into_inner());
        let skip = candles.len().saturating_sub(usize::from(limit));
        Ok(candles[skip..].to_vec())
    }

    async fn get_symbol_rules(&self, symbol: &str) -> Result<SymbolRules, ExchangeError> {
        self.check_symbol(symbol)?;
        Ok(self.rules.clone())
    }
}

#[async_trait]
impl ExecutionHandler for PaperExchange {
    async fn set_leverage(&self, symbol: &str, leverage: u8) -> Result<(), ExchangeError> {
        self.check_symbol(symbol)?;
        self.execute(PaperOp::SetLeverage, PaperCall::SetLeverage(leverage), |_| Ok(()))
    }

    async fn get_balance(&self, _asset: &str) -> Result<Decimal, ExchangeError> {
        self.execute(PaperOp::GetBalance, PaperCall::GetBalance, |book| Ok(book.balance))
    }

    async fn get_position(&self, symbol: &str) -> Result<PositionState, ExchangeError> {
        self.check_symbol(symbol)?;
        self.stall_if_armed(PaperOp::GetPosition).await;
        self.execute(PaperOp::GetPosition, PaperCall::GetPosition, |book| {
            Ok(PositionState::from_signed(book.position, book.entry_price))
        })
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        reduce_only: bool,
        client_order_id: &str,
    ) -> Result<OrderAck, ExchangeError> {
        self.check_symbol(symbol)?;
        self.stall_if_armed(PaperOp::MarketOrder).await;
        let call = PaperCall::MarketOrder {
            side,
            quantity,
            reduce_only,
        };
        self.execute(PaperOp::MarketOrder, call, |book| {
            if book.mark_price <= Decimal::ZERO {
                return Err(ExchangeError::Rejected {
                    code: -1013,
                    msg: "No mark price".into(),
                });
            }
            let mut signed = match side {
                Side::Buy => quantity,
                Side::Sell => -quantity,
            };
            if reduce_only {
                let reduces = !book.position.is_zero()
                    && book.position.is_sign_positive() != signed.is_sign_positive();
                if !reduces {
                    return Err(ExchangeError::Rejected {
                        code: -2022,
                        msg: "ReduceOnly Order is rejected.".into(),
                    });
                }
                let capped = quantity.min(book.position.abs());
                signed = if signed.is_sign_positive() { capped } else { -capped };
            }
            let ack = book.accept(client_order_id, "FILLED")?;
            book.fill(signed);
            Ok(ack)
        })
    }

    async fn place_stop_order(&self, request: &StopOrderRequest) -> Result<OrderAck, ExchangeError> {
        self.check_symbol(&request.symbol)?;
        self.stall_if_armed(PaperOp::StopOrder).await;
        self.book().stop_client_ids.push(request.client_order_id.clone());
        let call = PaperCall::StopOrder {
            kind: request.kind,
            side: request.side,
            stop_price: request.stop_price,
        };
        self.execute(PaperOp::StopOrder, call, |book| {
            let kind = match request.kind {
                StopKind::StopLoss => OrderKind::StopMarket,
                StopKind::TakeProfit => OrderKind::TakeProfitMarket,
            };
            let (quantity, close_position) = match request.quantity {
                StopQuantity::Quantity(q) => (q, false),
                StopQuantity::ClosePosition => (Decimal::ZERO, true),
            };
            let order = OpenOrder {
                order_id: String::new(),
                client_order_id: request.client_order_id.clone(),
                kind,
                side: request.side,
                stop_price: request.stop_price,
                quantity,
                reduce_only: request.reduce_only,
                close_position,
            };
            if book.mark_price > Decimal::ZERO && book.triggered(&order) {
                return Err(ExchangeError::Rejected {
                    code: -2021,
                    msg: "Order would immediately trigger.".into(),
                });
            }
            let ack = book.accept(&request.client_order_id, "NEW")?;
            book.orders.push(OpenOrder {
                order_id: ack.order_id.clone(),
                ..order
            });
            Ok(ack)
        })
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        self.check_symbol(symbol)?;
        let call = PaperCall::CancelOrder(order_id.to_string());
        self.execute(PaperOp::CancelOrder, call, |book| {
            let Some(at) = book.orders.iter().position(|o| o.order_id == order_id) else {
                return Err(ExchangeError::Rejected {
                    code: -2011,
                    msg: "Unknown order sent.".into(),
                });
            };
            let order = book.orders.remove(at);
            book.settle(&order, "CANCELED");
            Ok(())
        })
    }

    async fn cancel_all_open_orders(&self, symbol: &str) -> Result<(), ExchangeError> {
        self.check_symbol(symbol)?;
        self.execute(PaperOp::CancelAll, PaperCall::CancelAll, |book| {
            for order in std::mem::take(&mut book.orders) {
                book.settle(&order, "CANCELED");
            }
            Ok(())
        })
    }

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError> {
        self.check_symbol(symbol)?;
        self.execute(PaperOp::GetOpenOrders, PaperCall::GetOpenOrders, |book| {
            Ok(book.orders.clone())
        })
    }

    async fn query_order(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> Result<Option<OrderAck>, ExchangeError> {
        self.check_symbol(symbol)?;
        let call = PaperCall::QueryOrder(client_order_id.to_string());
        self.execute(PaperOp::QueryOrder, call, |book| {
            Ok(book.history.get(client_order_id).cloned())
        })
    }

    fn observe_price(&self, symbol: &str, price: Decimal) {
        if symbol == self.rules.symbol {
            self.set_mark_price(price);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn venue() -> PaperExchange {
        let ex = PaperExchange::new(
            SymbolRules {
                symbol: "BTCUSDT".into(),
                step_size: dec!(0.001),
                tick_size: dec!(0.1),
                min_qty: dec!(0.001),
                min_notional: dec!(5),
            },
            dec!(1000),
        );
        ex.set_mark_price(dec!(100));
        ex
    }

    fn stop(side: Side, kind: StopKind, price: Decimal) -> StopOrderRequest {
        StopOrderRequest {
            symbol: "BTCUSDT".into(),
            side,
            kind,
            stop_price: price,
            quantity: StopQuantity::Quantity(dec!(1)),
            reduce_only: true,
            client_order_id: format!("stop-{price}"),
        }
    }

    #[tokio::test]
    async fn market_orders_net_out_and_realize_pnl() {
        let ex = venue();
        ex.place_market_order("BTCUSDT", Side::Buy, dec!(2), false, "open").await.unwrap();
        assert_eq!(ex.position(), dec!(2));
        ex.set_mark_price(dec!(110));
        ex.place_market_order("BTCUSDT", Side::Sell, dec!(2), true, "close").await.unwrap();
        assert_eq!(ex.position(), Decimal::ZERO);
        assert_eq!(ex.balance(), dec!(1020));
    }

    #[tokio::test]
    async fn reduce_only_cannot_open() {
        let ex = venue();
        let err = ex
            .place_market_order("BTCUSDT", Side::Sell, dec!(1), true, "close")
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Rejected { code: -2022, .. }));
    }

    #[tokio::test]
    async fn stop_fires_when_crossed() {
        let ex = venue();
        ex.place_market_order("BTCUSDT", Side::Buy, dec!(1), false, "open").await.unwrap();
        ex.place_stop_order(&stop(Side::Sell, StopKind::StopLoss, dec!(95))).await.unwrap();
        ex.set_mark_price(dec!(96));
        assert_eq!(ex.position(), dec!(1));
        ex.set_mark_price(dec!(94.9));
        assert_eq!(ex.position(), Decimal::ZERO);
        assert!(ex.resting_orders().is_empty());
    }

    #[tokio::test]
    async fn stop_on_wrong_side_is_rejected() {
        let ex = venue();
        let err = ex
            .place_stop_order(&stop(Side::Sell, StopKind::StopLoss, dec!(101)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Rejected { code: -2021, .. }));
    }

    #[tokio::test]
    async fn lost_ack_still_applies() {
        let ex = venue();
        ex.fail_after_apply(PaperOp::MarketOrder, ExchangeError::Timeout("lost".into()));
        let res = ex.place_market_order("BTCUSDT", Side::Buy, dec!(1), false, "open").await;
        assert!(matches!(res, Err(ExchangeError::Timeout(_))));
        assert_eq!(ex.position(), dec!(1));
    }

    #[tokio::test]
    async fn close_position_stop_flattens_whatever_is_held() {
        let ex = venue();
        ex.place_market_order("BTCUSDT", Side::Buy, dec!(3), false, "open").await.unwrap();
        let mut request = stop(Side::Sell, StopKind::StopLoss, dec!(95));
        request.quantity = StopQuantity::ClosePosition;
        request.reduce_only = false;
        ex.place_stop_order(&request).await.unwrap();
        ex.set_mark_price(dec!(94));
        assert_eq!(ex.position(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn orders_are_found_by_client_id() {
        let ex = venue();
        ex.place_market_order("BTCUSDT", Side::Buy, dec!(1), false, "open").await.unwrap();
        ex.place_stop_order(&stop(Side::Sell, StopKind::StopLoss, dec!(95))).await.unwrap();

        let entry = ex.query_order("BTCUSDT", "open").await.unwrap().unwrap();
        assert_eq!(entry.status, "FILLED");
        assert_eq!(ex.query_order("BTCUSDT", "missing").await.unwrap(), None);

        ex.cancel_all_open_orders("BTCUSDT").await.unwrap();
        let stop = ex.query_order("BTCUSDT", "stop-95").await.unwrap().unwrap();
        assert_eq!(stop.status, "CANCELED");
    }

    #[tokio::test]
    async fn reused_client_id_is_refused() {
        let ex = venue();
        ex.place_market_order("BTCUSDT", Side::Buy, dec!(1), false, "open").await.unwrap();
        let err = ex
            .place_market_order("BTCUSDT", Side::Buy, dec!(1), false, "open")
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Rejected { code: -4116, .. }));
        assert_eq!(ex.position(), dec!(1));
    }

    #[tokio::test]
    async fn unknown_symbol_is_reported() {
        let ex = venue();
        let err = ex.get_symbol_rules("DOGEUSDT").await.unwrap_err();
        assert_eq!(err, ExchangeError::UnknownSymbol("DOGEUSDT".into()));
    }
}
