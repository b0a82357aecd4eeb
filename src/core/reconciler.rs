// src/core/reconciler.rs
use crate::config::AppConfig;
use crate::connectors::traits::ExecutionHandler;
use crate::core::cooldown::{CooldownVerdict, LastSignal, SignalCooldown};
use crate::core::sizing::{size_order, SizingInput};
use crate::errors::{ExchangeError, ProtectionError, ValidationError};
use crate::indicators::FeatureRow;
use crate::strategies::AtrLevels;
use crate::types::{
    new_client_order_id, OpenOrder, OrderKind, PositionSide, PositionState, Side, Signal,
    SignalSide, StopKind, StopOrderRequest, StopQuantity, SymbolRules,
};
use crate::utils::precision::{guard_trigger_price, TriggerPlacement};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrailingSettings {
    /// Stop advance per tick, in ATRs.
    pub atr_step: f64,
    /// Minimum distance kept between stop and price, in ATRs.
    pub atr_gap: f64,
}

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub symbol: String,
    pub quote_asset: String,
    pub leverage: u8,
    pub risk_fraction: Decimal,
    pub min_stop_ticks: u32,
    pub call_timeout: Duration,
    pub read_retries: u32,
    pub retry_delay: Duration,
    pub confirm_attempts: u32,
    pub confirm_delay: Duration,
    pub trailing: Option<TrailingSettings>,
    pub bump_to_min_notional: bool,
}

impl ReconcilerSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            symbol: cfg.symbol.clone(),
            quote_asset: cfg.quote_asset.clone(),
            leverage: cfg.leverage,
            risk_fraction: cfg.risk_fraction,
            min_stop_ticks: cfg.min_stop_ticks,
            call_timeout: cfg.request_timeout(),
            read_retries: cfg.read_retries,
            retry_delay: Duration::from_millis(cfg.confirm_delay_ms),
            confirm_attempts: cfg.confirm_attempts,
            confirm_delay: Duration::from_millis(cfg.confirm_delay_ms),
            trailing: cfg.trailing.enabled.then_some(TrailingSettings {
                atr_step: cfg.trailing.atr_step,
                atr_gap: cfg.trailing.atr_gap,
            }),
            bump_to_min_notional: cfg.sizing.bump_to_min_notional,
        }
    }
}

/// Raised when a position is (or may be) open without its protective orders.
#[derive(Debug, Clone, PartialEq)]
pub struct UnprotectedAlarm {
    pub side: PositionSide,
    pub quantity: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub cause: ProtectionError,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntryReport {
    pub side: SignalSide,
    pub quantity: Decimal,
    /// `None` when the entry ack was lost and the fill was confirmed by re-query.
    pub entry_order_id: Option<String>,
    pub stop_order_id: String,
    pub tp_order_id: String,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
}

/// What a single tick did. Every variant is a distinct status an operator can act on.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Indicators not warm yet; nothing was evaluated.
    Indeterminate,
    NoSignal,
    Held {
        side: PositionSide,
    },
    CooldownSuppressed {
        side: SignalSide,
        remaining_ms: i64,
    },
    Opened(EntryReport),
    Flipped {
        closed: PositionSide,
        closed_quantity: Decimal,
        entry: EntryReport,
    },
    /// The opposite position was closed but the new entry did not happen.
    ClosedOnly {
        closed: PositionSide,
        follow_up: Box<TickOutcome>,
    },
    StopTrailed {
        from: Decimal,
        to: Decimal,
    },
    OrphansCancelled {
        count: usize,
    },
    ProtectionRestored {
        side: PositionSide,
    },
    Rejected(ValidationError),
    /// Nothing was changed on the exchange (or the change is known to be undone).
    Aborted(ExchangeError),
    /// A mutating call failed and the follow-up query failed too.
    OutcomeUnknown {
        action: &'static str,
        error: ExchangeError,
    },
    CloseUnconfirmed {
        remaining: Decimal,
    },
    Unprotected(UnprotectedAlarm),
}

impl TickOutcome {
    pub fn is_alarm(&self) -> bool {
        matches!(
            self,
            TickOutcome::Unprotected(_) | TickOutcome::OutcomeUnknown { .. }
        )
    }

    pub fn status(&self) -> &'static str {
        match self {
            TickOutcome::Indeterminate => "indeterminate",
            TickOutcome::NoSignal => "no_signal",
            TickOutcome::Held { .. } => "held",
            TickOutcome::CooldownSuppressed { .. } => "cooldown_suppressed",
            TickOutcome::Opened(_) => "opened",
            TickOutcome::Flipped { .. } => "flipped",
            TickOutcome::ClosedOnly { .. } => "closed_only",
            TickOutcome::StopTrailed { .. } => "stop_trailed",
            TickOutcome::OrphansCancelled { .. } => "orphans_cancelled",
            TickOutcome::ProtectionRestored { .. } => "protection_restored",
            TickOutcome::Rejected(_) => "rejected",
            TickOutcome::Aborted(_) => "aborted",
            TickOutcome::OutcomeUnknown { .. } => "outcome_unknown",
            TickOutcome::CloseUnconfirmed { .. } => "close_unconfirmed",
            TickOutcome::Unprotected(_) => "unprotected",
        }
    }
}

pub struct TickInput<'a> {
    pub signal: &'a Signal,
    pub row: &'a FeatureRow,
    /// Latest traded price, used for sizing and stop distance.
    pub price: Decimal,
}

/// Position and resting orders as read at the start of a tick.
#[derive(Debug, Clone)]
struct Snapshot {
    position: PositionState,
    orders: Vec<OpenOrder>,
}

impl Snapshot {
    /// Tightest protective stop for the open position.
    fn active_stop(&self) -> Option<&OpenOrder> {
        let exit = self.position.side.exit_side()?;
        let stops = self
            .orders
            .iter()
            .filter(|o| o.kind == OrderKind::StopMarket && o.side == exit && o.is_protective());
        match self.position.side {
            PositionSide::Long => stops.max_by(|a, b| a.stop_price.cmp(&b.stop_price)),
            _ => stops.min_by(|a, b| a.stop_price.cmp(&b.stop_price)),
        }
    }

    fn active_take_profit(&self) -> Option<&OpenOrder> {
        let exit = self.position.side.exit_side()?;
        self.orders
            .iter()
            .find(|o| o.kind == OrderKind::TakeProfitMarket && o.side == exit && o.is_protective())
    }
}

/// What a lost entry acknowledgement turned out to mean.
enum EntryResolution {
    Filled,
    NotFilled,
    Unknown,
}

fn stop_placement(position: PositionSide, kind: StopKind) -> TriggerPlacement {
    match (position, kind) {
        (PositionSide::Long, StopKind::StopLoss) | (PositionSide::Short, StopKind::TakeProfit) => {
            TriggerPlacement::BelowMarket
        }
        _ => TriggerPlacement::AboveMarket,
    }
}

/// Drives the FLAT / LONG_OPEN / SHORT_OPEN state machine for one symbol.
///
/// Holds no position state between ticks: every tick starts from a fresh read
/// of the exchange. The only carried state is the cooldown memory and the
/// unprotected-position alarm.
pub struct Reconciler {
    exchange: Arc<dyn ExecutionHandler>,
    rules: SymbolRules,
    settings: ReconcilerSettings,
    levels: AtrLevels,
    cooldown: SignalCooldown,
    alarm: Option<UnprotectedAlarm>,
}

impl Reconciler {
    pub fn new(
        exchange: Arc<dyn ExecutionHandler>,
        rules: SymbolRules,
        settings: ReconcilerSettings,
        levels: AtrLevels,
        cooldown: SignalCooldown,
    ) -> Result<Self, ValidationError> {
        if rules.step_size <= Decimal::ZERO || rules.tick_size <= Decimal::ZERO {
            return Err(ValidationError::InvalidRules(format!(
                "step_size={} tick_size={} must be positive",
                rules.step_size, rules.tick_size
            )));
        }
        if rules.symbol != settings.symbol {
            return Err(ValidationError::InvalidRules(format!(
                "rules for {} do not match {}",
                rules.symbol, settings.symbol
            )));
        }
        Ok(Self {
            exchange,
            rules,
            settings,
            levels,
            cooldown,
            alarm: None,
        })
    }

    pub fn alarm(&self) -> Option<&UnprotectedAlarm> {
        self.alarm.as_ref()
    }

    pub fn last_signal(&self) -> Option<LastSignal> {
        self.cooldown.last()
    }

    pub fn restore_last_signal(&mut self, last: Option<LastSignal>) {
        self.cooldown.restore(last);
    }

    pub fn rules(&self) -> &SymbolRules {
        &self.rules
    }

    pub fn observe_price(&self, price: Decimal) {
        self.exchange.observe_price(&self.settings.symbol, price);
    }

    pub async fn tick(&mut self, input: TickInput<'_>) -> TickOutcome {
        let mut snapshot = match self.fetch_snapshot().await {
            Ok(s) => s,
            Err(e) => return TickOutcome::Aborted(e),
        };
        let position_side = snapshot.position.side;

        if position_side == PositionSide::Flat {
            if let Some(alarm) = self.alarm.take() {
                info!(side = %alarm.side, "Position is flat, clearing unprotected alarm");
            }
        } else if self.alarm.is_some() || snapshot.position.active_stop_order_id.is_none() {
            if self.alarm.is_none() {
                error!(
                    side = %position_side,
                    quantity = %snapshot.position.quantity,
                    "Open position has no stop-loss on the book"
                );
            }
            return self.restore_protection(&snapshot, &input).await;
        }

        let signal_side = input.signal.side;

        // nothing may rest on a flat symbol, whatever the signal says
        if position_side == PositionSide::Flat && !snapshot.orders.is_empty() {
            let count = snapshot.orders.len();
            warn!(count, "Cancelling orders left on a flat symbol");
            if let Err(e) = self.clear_book().await {
                return TickOutcome::Aborted(e);
            }
            snapshot.orders.clear();
            if signal_side == SignalSide::None {
                return TickOutcome::OrphansCancelled { count };
            }
        }

        match (position_side, signal_side) {
            (PositionSide::Flat, SignalSide::None) => TickOutcome::NoSignal,
            (PositionSide::Flat, _) => self.open(&snapshot, &input).await,
            (side, SignalSide::None) => TickOutcome::Held { side },
            (side, sig) if side.matches(sig) => match self.settings.trailing {
                Some(trailing) => self.trail(&snapshot, &input, trailing).await,
                None => TickOutcome::Held { side },
            },
            _ => self.flip(snapshot, &input).await,
        }
    }

    // --- exchange call plumbing ---

    async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T, ExchangeError>>,
    ) -> Result<T, ExchangeError> {
        match timeout(self.settings.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ExchangeError::Timeout(format!(
                "no response within {:?}",
                self.settings.call_timeout
            ))),
        }
    }

    /// Read-only call, retried on transient failures.
    async fn read<T, F, Fut>(&self, what: &'static str, mut op: F) -> Result<T, ExchangeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        let mut attempt = 0;
        loop {
            match self.call(op()).await {
                Err(e) if e.is_transient() && attempt < self.settings.read_retries => {
                    attempt += 1;
                    warn!(call = what, attempt, error = %e, "Transient read failure, retrying");
                    sleep(self.settings.retry_delay).await;
                }
                other => return other,
            }
        }
    }

    async fn read_position(&self) -> Result<PositionState, ExchangeError> {
        let ex = &self.exchange;
        let symbol = self.settings.symbol.as_str();
        self.read("get_position", move || ex.get_position(symbol)).await
    }

    async fn read_open_orders(&self) -> Result<Vec<OpenOrder>, ExchangeError> {
        let ex = &self.exchange;
        let symbol = self.settings.symbol.as_str();
        self.read("get_open_orders", move || ex.get_open_orders(symbol)).await
    }

    async fn fetch_snapshot(&self) -> Result<Snapshot, ExchangeError> {
        let position = self.read_position().await?;
        let orders = self.read_open_orders().await?;
        let mut snapshot = Snapshot { position, orders };
        snapshot.position.active_stop_order_id = snapshot.active_stop().map(|o| o.order_id.clone());
        snapshot.position.active_tp_order_id =
            snapshot.active_take_profit().map(|o| o.order_id.clone());
        Ok(snapshot)
    }

    // --- transitions ---

    /// Cancels everything on the symbol; a failed cancel is accepted if the
    /// book turns out to be empty anyway.
    async fn clear_book(&self) -> Result<(), ExchangeError> {
        let symbol = &self.settings.symbol;
        let Err(e) = self.call(self.exchange.cancel_all_open_orders(symbol)).await else {
            return Ok(());
        };
        warn!(error = %e, "Cancel-all failed, re-checking open orders");
        match self.read_open_orders().await {
            Ok(orders) if orders.is_empty() => Ok(()),
            _ => Err(e),
        }
    }

    async fn open(&mut self, snapshot: &Snapshot, input: &TickInput<'_>) -> TickOutcome {
        let signal = input.signal;
        let position = signal.side.as_position();
        let Some(entry_side) = signal.side.entry_side() else {
            return TickOutcome::NoSignal;
        };

        if let CooldownVerdict::Suppressed { remaining_ms } = self.cooldown.check(signal.side) {
            info!(side = ?signal.side, remaining_ms, "Signal suppressed by cooldown");
            return TickOutcome::CooldownSuppressed {
                side: signal.side,
                remaining_ms,
            };
        }

        let (stop_loss, take_profit) = match self.protective_levels(signal, position, input.price) {
            Ok(levels) => levels,
            Err(e) => return TickOutcome::Rejected(e),
        };

        if !snapshot.orders.is_empty() {
            info!(count = snapshot.orders.len(), "Cancelling stale orders before entry");
            if let Err(e) = self.clear_book().await {
                return TickOutcome::Aborted(e);
            }
        }

        let balance = {
            let ex = &self.exchange;
            let asset = self.settings.quote_asset.as_str();
            match self.read("get_balance", move || ex.get_balance(asset)).await {
                Ok(b) => b,
                Err(e) => return TickOutcome::Aborted(e),
            }
        };

        let sizing = SizingInput {
            balance,
            leverage: self.settings.leverage,
            risk_fraction: self.settings.risk_fraction,
            price: input.price,
        };
        let quantity = match size_order(sizing, &self.rules, self.settings.bump_to_min_notional) {
            Ok(q) => q,
            Err(e) => {
                warn!(error = %e, %balance, price = %input.price, "Entry rejected by sizing");
                return TickOutcome::Rejected(e);
            }
        };

        info!(
            side = %position,
            %quantity,
            price = %input.price,
            %stop_loss,
            %take_profit,
            "Opening position"
        );

        let client_id = new_client_order_id();
        let entry_order_id = match self
            .call(self.exchange.place_market_order(
                &self.settings.symbol,
                entry_side,
                quantity,
                false,
                &client_id,
            ))
            .await
        {
            Ok(ack) => Some(ack.order_id),
            Err(e) if e.is_transient() => {
                warn!(error = %e, client_order_id = %client_id, "Entry outcome unknown, re-querying");
                match self.resolve_entry(position, &client_id).await {
                    EntryResolution::Filled => None,
                    EntryResolution::NotFilled => return TickOutcome::Aborted(e),
                    EntryResolution::Unknown => {
                        return TickOutcome::OutcomeUnknown {
                            action: "market entry",
                            error: e,
                        }
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Entry order rejected");
                return TickOutcome::Aborted(e);
            }
        };

        // from here on the tick runs to completion
        self.cooldown.record(signal.side);

        let filled = match self.read_position().await {
            Ok(p) if p.side == position => p.quantity,
            _ => quantity,
        };

        let stop_order_id = match self
            .place_protective(position, StopKind::StopLoss, stop_loss, filled)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                return self.raise_alarm(position, filled, Some(stop_loss), Some(take_profit), e)
            }
        };
        let tp_order_id = match self
            .place_protective(position, StopKind::TakeProfit, take_profit, filled)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                return self.raise_alarm(position, filled, Some(stop_loss), Some(take_profit), e)
            }
        };

        info!(side = %position, quantity = %filled, "Position opened and protected");
        TickOutcome::Opened(EntryReport {
            side: signal.side,
            quantity: filled,
            entry_order_id,
            stop_order_id,
            tp_order_id,
            stop_loss,
            take_profit,
        })
    }

    /// Settles an entry whose acknowledgement was lost. The position decides
    /// first; when it is still flat the order itself is looked up by client id.
    async fn resolve_entry(&self, position: PositionSide, client_id: &str) -> EntryResolution {
        match self.read_position().await {
            Ok(p) if p.side == position => return EntryResolution::Filled,
            Ok(_) => {}
            Err(_) => return EntryResolution::Unknown,
        }

        let ex = &self.exchange;
        let symbol = self.settings.symbol.as_str();
        let found = self
            .read("query_order", move || ex.query_order(symbol, client_id))
            .await;
        match found {
            Ok(None) => {
                info!(client_order_id = %client_id, "Entry never reached the exchange");
                EntryResolution::NotFilled
            }
            Ok(Some(ack)) if matches!(ack.status.as_str(), "CANCELED" | "EXPIRED" | "REJECTED") => {
                info!(client_order_id = %client_id, status = %ack.status, "Entry ended unfilled");
                EntryResolution::NotFilled
            }
            Ok(Some(ack)) => {
                // known to the exchange; trust a position that has caught up, nothing else
                warn!(client_order_id = %client_id, status = %ack.status, "Entry exists, position not yet visible");
                match self.read_position().await {
                    Ok(p) if p.side == position => EntryResolution::Filled,
                    _ => EntryResolution::Unknown,
                }
            }
            Err(e) => {
                error!(client_order_id = %client_id, error = %e, "Entry lookup failed");
                EntryResolution::Unknown
            }
        }
    }

    /// Stop-loss and take-profit for a new entry, snapped to the tick grid
    /// and kept at least `min_stop_ticks` away from `price`.
    fn protective_levels(
        &self,
        signal: &Signal,
        position: PositionSide,
        price: Decimal,
    ) -> Result<(Decimal, Decimal), ValidationError> {
        let sl = signal
            .stop_loss
            .ok_or(ValidationError::MissingProtectiveLevel("stop_loss"))?;
        let tp = signal
            .take_profit
            .ok_or(ValidationError::MissingProtectiveLevel("take_profit"))?;
        let guard = |level: Decimal, kind: StopKind| {
            guard_trigger_price(
                level,
                price,
                stop_placement(position, kind),
                self.rules.tick_size,
                self.settings.min_stop_ticks,
            )
            .ok_or(ValidationError::InvalidPrice(level))
        };
        Ok((guard(sl, StopKind::StopLoss)?, guard(tp, StopKind::TakeProfit)?))
    }

    /// Places one reduce-only trigger order. A transient failure is checked
    /// against the book before a single retry under the same client id.
    async fn place_protective(
        &self,
        position: PositionSide,
        kind: StopKind,
        stop_price: Decimal,
        quantity: Decimal,
    ) -> Result<String, ProtectionError> {
        let side = position.exit_side().ok_or(ValidationError::FlatPosition)?;
        let request = StopOrderRequest {
            symbol: self.settings.symbol.clone(),
            side,
            kind,
            stop_price,
            quantity: StopQuantity::Quantity(quantity),
            reduce_only: true,
            client_order_id: new_client_order_id(),
        };
        let order_kind = match kind {
            StopKind::StopLoss => OrderKind::StopMarket,
            StopKind::TakeProfit => OrderKind::TakeProfitMarket,
        };

        let mut last_error = None;
        for attempt in 0..2 {
            match self.call(self.exchange.place_stop_order(&request)).await {
                Ok(ack) => {
                    info!(?kind, %stop_price, order_id = %ack.order_id, "Protective order placed");
                    return Ok(ack.order_id);
                }
                Err(e) if e.is_transient() => {
                    warn!(?kind, attempt, error = %e, "Protective order outcome unknown");
                    let orders = self.read_open_orders().await?;
                    if let Some(existing) = orders.iter().find(|o| {
                        o.client_order_id == request.client_order_id
                            || (o.kind == order_kind && o.side == side && o.stop_price == stop_price)
                    }) {
                        return Ok(existing.order_id.clone());
                    }
                    last_error = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        let error = last_error.unwrap_or_else(|| ExchangeError::Network("protective order not placed".into()));
        Err(error.into())
    }

    fn raise_alarm(
        &mut self,
        side: PositionSide,
        quantity: Decimal,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
        cause: impl Into<ProtectionError>,
    ) -> TickOutcome {
        let alarm = UnprotectedAlarm {
            side,
            quantity,
            stop_loss,
            take_profit,
            cause: cause.into(),
        };
        error!(
            side = %side,
            %quantity,
            stop_loss = ?stop_loss,
            take_profit = ?take_profit,
            cause = %alarm.cause,
            "POSITION UNPROTECTED"
        );
        self.alarm = Some(alarm.clone());
        TickOutcome::Unprotected(alarm)
    }

    /// Re-places whichever protective orders are missing for the open position.
    async fn restore_protection(&mut self, snapshot: &Snapshot, input: &TickInput<'_>) -> TickOutcome {
        let position = &snapshot.position;
        let side = position.side;
        let signal_side = match side {
            PositionSide::Long => SignalSide::Long,
            PositionSide::Short => SignalSide::Short,
            PositionSide::Flat => SignalSide::None,
        };

        let remembered = self
            .alarm
            .as_ref()
            .filter(|a| a.side == side)
            .and_then(|a| a.stop_loss.zip(a.take_profit));
        let Some((sl, tp)) = remembered.or_else(|| self.levels.levels(signal_side, input.row)) else {
            return self.raise_alarm(
                side,
                position.quantity,
                None,
                None,
                ValidationError::NoProtectiveLevels,
            );
        };

        let tick = self.rules.tick_size;
        let min_ticks = self.settings.min_stop_ticks;
        let guarded = |level: Decimal, kind: StopKind| {
            guard_trigger_price(level, input.price, stop_placement(side, kind), tick, min_ticks)
        };
        let (Some(guarded_sl), Some(guarded_tp)) =
            (guarded(sl, StopKind::StopLoss), guarded(tp, StopKind::TakeProfit))
        else {
            let collapsed = if guarded(sl, StopKind::StopLoss).is_none() { sl } else { tp };
            return self.raise_alarm(
                side,
                position.quantity,
                Some(sl),
                Some(tp),
                ValidationError::InvalidPrice(collapsed),
            );
        };
        let (sl, tp) = (guarded_sl, guarded_tp);

        warn!(side = %side, quantity = %position.quantity, %sl, %tp, "Restoring protective orders");

        if position.active_stop_order_id.is_none() {
            if let Err(e) = self
                .place_protective(side, StopKind::StopLoss, sl, position.quantity)
                .await
            {
                return self.raise_alarm(side, position.quantity, Some(sl), Some(tp), e);
            }
        }
        if position.active_tp_order_id.is_none() {
            if let Err(e) = self
                .place_protective(side, StopKind::TakeProfit, tp, position.quantity)
                .await
            {
                return self.raise_alarm(side, position.quantity, Some(sl), Some(tp), e);
            }
        }

        if self.alarm.take().is_some() {
            info!(side = %side, "Unprotected alarm cleared");
        }
        TickOutcome::ProtectionRestored { side }
    }

    async fn flip(&mut self, snapshot: Snapshot, input: &TickInput<'_>) -> TickOutcome {
        let closing = snapshot.position.side;
        let target = input.signal.side.as_position();

        if let CooldownVerdict::Suppressed { remaining_ms } = self.cooldown.check(input.signal.side) {
            info!(side = ?input.signal.side, remaining_ms, "Flip suppressed by cooldown");
            return TickOutcome::CooldownSuppressed {
                side: input.signal.side,
                remaining_ms,
            };
        }
        if let Err(e) = self.protective_levels(input.signal, target, input.price) {
            return TickOutcome::Rejected(e);
        }
        let Some(exit_side) = closing.exit_side() else {
            return TickOutcome::NoSignal;
        };

        let quantity = snapshot.position.quantity;
        info!(from = %closing, to = %target, %quantity, "Closing position before reversal");

        if let Err(e) = self.close_position(exit_side, quantity).await {
            return e;
        }

        let refreshed = match self.fetch_snapshot().await {
            Ok(s) => s,
            Err(e) => {
                return TickOutcome::ClosedOnly {
                    closed: closing,
                    follow_up: Box::new(TickOutcome::Aborted(e)),
                }
            }
        };

        match self.open(&refreshed, input).await {
            TickOutcome::Opened(entry) => TickOutcome::Flipped {
                closed: closing,
                closed_quantity: quantity,
                entry,
            },
            alarm @ TickOutcome::Unprotected(_) => alarm,
            alarm @ TickOutcome::OutcomeUnknown { .. } => alarm,
            other => {
                warn!(closed = %closing, status = other.status(), "Closed but did not re-enter");
                TickOutcome::ClosedOnly {
                    closed: closing,
                    follow_up: Box::new(other),
                }
            }
        }
    }

    /// Reduce-only market close, then polls until the exchange reports flat.
    async fn close_position(&self, exit_side: Side, quantity: Decimal) -> Result<(), TickOutcome> {
        let symbol = &self.settings.symbol;
        let client_id = new_client_order_id();
        match self
            .call(self.exchange.place_market_order(symbol, exit_side, quantity, true, &client_id))
            .await
        {
            Ok(ack) => info!(order_id = %ack.order_id, "Close order accepted"),
            Err(e) if e.is_transient() => warn!(error = %e, "Close outcome unknown, re-querying"),
            Err(e) => {
                error!(error = %e, "Close order rejected");
                return Err(TickOutcome::Aborted(e));
            }
        }

        let mut last_error = None;
        let mut remaining = quantity;
        for attempt in 0..self.settings.confirm_attempts.max(1) {
            if attempt > 0 {
                sleep(self.settings.confirm_delay).await;
            }
            match self.read_position().await {
                Ok(p) if p.is_flat() => return Ok(()),
                Ok(p) => {
                    remaining = p.quantity;
                    last_error = None;
                }
                Err(e) => last_error = Some(e),
            }
        }

        match last_error {
            Some(error) => Err(TickOutcome::OutcomeUnknown {
                action: "close",
                error,
            }),
            None => {
                error!(%remaining, "Close not confirmed, position still open");
                Err(TickOutcome::CloseUnconfirmed { remaining })
            }
        }
    }

    /// Moves the stop toward price by `atr_step` ATRs, never closer than
    /// `atr_gap` ATRs, and only ever in the position's favour.
    async fn trail(
        &mut self,
        snapshot: &Snapshot,
        input: &TickInput<'_>,
        trailing: TrailingSettings,
    ) -> TickOutcome {
        let position = &snapshot.position;
        let side = position.side;
        let held = TickOutcome::Held { side };

        let Some(current) = snapshot.active_stop() else {
            return held;
        };
        let from = current.stop_price;
        let (Some(step), Some(gap)) = (
            Decimal::from_f64(input.row.atr * trailing.atr_step),
            Decimal::from_f64(input.row.atr * trailing.atr_gap),
        ) else {
            return held;
        };
        let price = input.price;

        let candidate = match side {
            PositionSide::Long if price > position.entry_price => (from + step).min(price - gap),
            PositionSide::Short if price < position.entry_price => (from - step).max(price + gap),
            _ => return held,
        };
        let Some(to) = guard_trigger_price(
            candidate,
            price,
            stop_placement(side, StopKind::StopLoss),
            self.rules.tick_size,
            self.settings.min_stop_ticks,
        ) else {
            return held;
        };

        let tightens = match side {
            PositionSide::Long => to > from,
            _ => to < from,
        };
        if !tightens {
            return held;
        }

        let new_id = match self
            .place_protective(side, StopKind::StopLoss, to, position.quantity)
            .await
        {
            Ok(id) => id,
            Err(ProtectionError::Exchange(e)) => {
                warn!(error = %e, %from, %to, "Trailing stop not placed, keeping current stop");
                return TickOutcome::Aborted(e);
            }
            Err(ProtectionError::Invalid(e)) => return TickOutcome::Rejected(e),
        };

        let exit = side.exit_side();
        for old in snapshot
            .orders
            .iter()
            .filter(|o| o.kind == OrderKind::StopMarket && Some(o.side) == exit && o.order_id != new_id)
        {
            let cancelled = self
                .call(self.exchange.cancel_order(&self.settings.symbol, &old.order_id))
                .await;
            if let Err(e) = cancelled {
                warn!(order_id = %old.order_id, error = %e, "Failed to cancel superseded stop");
            }
        }

        info!(side = %side, %from, %to, "Stop trailed");
        TickOutcome::StopTrailed { from, to }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn order(id: &str, kind: OrderKind, side: Side, price: Decimal) -> OpenOrder {
        OpenOrder {
            order_id: id.into(),
            client_order_id: String::new(),
            kind,
            side,
            stop_price: price,
            quantity: dec!(1),
            reduce_only: true,
            close_position: false,
        }
    }

    #[test]
    fn tightest_stop_wins() {
        let snapshot = Snapshot {
            position: PositionState::from_signed(dec!(1), dec!(100)),
            orders: vec![
                order("1", OrderKind::StopMarket, Side::Sell, dec!(95)),
                order("2", OrderKind::StopMarket, Side::Sell, dec!(97)),
                order("3", OrderKind::TakeProfitMarket, Side::Sell, dec!(110)),
                order("4", OrderKind::StopMarket, Side::Buy, dec!(99)),
            ],
        };
        assert_eq!(snapshot.active_stop().unwrap().order_id, "2");
        assert_eq!(snapshot.active_take_profit().unwrap().order_id, "3");
    }

    #[test]
    fn short_uses_lowest_buy_stop() {
        let snapshot = Snapshot {
            position: PositionState::from_signed(dec!(-1), dec!(100)),
            orders: vec![
                order("1", OrderKind::StopMarket, Side::Buy, dec!(105)),
                order("2", OrderKind::StopMarket, Side::Buy, dec!(103)),
            ],
        };
        assert_eq!(snapshot.active_stop().unwrap().order_id, "2");
    }

    #[test]
    fn flat_has_no_protection() {
        let snapshot = Snapshot {
            position: PositionState::flat(),
            orders: vec![order("1", OrderKind::StopMarket, Side::Sell, dec!(95))],
        };
        assert!(snapshot.active_stop().is_none());
    }

    #[test]
    fn placement_follows_position() {
        assert_eq!(
            stop_placement(PositionSide::Long, StopKind::StopLoss),
            TriggerPlacement::BelowMarket
        );
        assert_eq!(
            stop_placement(PositionSide::Short, StopKind::StopLoss),
            TriggerPlacement::AboveMarket
        );
        assert_eq!(
            stop_placement(PositionSide::Short, StopKind::TakeProfit),
            TriggerPlacement::BelowMarket
        );
    }

    #[test]
    fn alarms_are_flagged() {
        assert!(TickOutcome::Unprotected(UnprotectedAlarm {
            side: PositionSide::Long,
            quantity: dec!(1),
            stop_loss: None,
            take_profit: None,
            cause: ValidationError::NoProtectiveLevels.into(),
        })
        .is_alarm());
        assert!(!TickOutcome::NoSignal.is_alarm());
        assert_eq!(TickOutcome::NoSignal.status(), "no_signal");
    }
}
