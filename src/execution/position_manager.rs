use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;

use crate::models::{
    HistoricalOrder, OrderStatus, OrderType, SessionState, Side, TradeOutcome, TradingStats,
};

/// Default history lookback before the entry time when attributing a close
pub const OUTCOME_LOOKBACK: Duration = Duration::minutes(5);

/// What changed in the live position since the previous observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionTransition {
    Opened,
    /// Non-zero to zero while the session still holds an entry
    Closed,
    Unchanged,
}

/// Session bookkeeping and cumulative stats for the single traded symbol.
///
/// Owned by the trading loop; readers get copies.
#[derive(Debug, Default)]
pub struct PositionStateMachine {
    session: SessionState,
    stats: TradingStats,
    had_open_position: bool,
}

impl PositionStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn stats(&self) -> TradingStats {
        self.stats
    }

    pub fn had_open_position(&self) -> bool {
        self.had_open_position
    }

    /// Entry allowed: flat, and this candle not already handled
    pub fn can_enter(&self, candle_close_time: DateTime<Utc>) -> bool {
        self.session.is_flat()
            && self.session.last_processed_candle_close_time != Some(candle_close_time)
    }

    pub fn mark_processed(&mut self, candle_close_time: DateTime<Utc>) {
        self.session.last_processed_candle_close_time = Some(candle_close_time);
    }

    /// Record a filled entry
    ///
    /// The bot's own fill counts as an observed open position, so a close
    /// that happens before the next observation is still detected.
    pub fn record_entry(
        &mut self,
        side: Side,
        entry_price: Decimal,
        qty: Decimal,
        opened_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        if let Some(active) = self.session.side {
            anyhow::bail!("Session already holds a {} position", active);
        }

        self.session.side = Some(side);
        self.session.entry_price = Some(entry_price);
        self.session.entry_qty = Some(qty);
        self.session.opened_at = Some(opened_at);
        self.session.planned_take_profit = None;
        self.had_open_position = true;

        Ok(())
    }

    pub fn set_planned_take_profit(&mut self, take_profit: Decimal) {
        if !self.session.is_flat() {
            self.session.planned_take_profit = Some(take_profit);
        }
    }

    /// Feed the latest exchange-reported quantity
    pub fn observe_position(&mut self, qty: Decimal) -> PositionTransition {
        let is_open = !qty.is_zero();

        let transition = match (self.had_open_position, is_open) {
            (true, false) if self.session.entry_price.is_some() => PositionTransition::Closed,
            (false, true) => PositionTransition::Opened,
            _ => PositionTransition::Unchanged,
        };

        self.had_open_position = is_open;
        transition
    }

    /// Count the finished trade and return to flat
    pub fn apply_close(&mut self, outcome: TradeOutcome) -> TradingStats {
        self.stats.record(outcome);
        self.session.reset();
        self.stats
    }

    /// Drop the session without counting a trade
    pub fn reset_session(&mut self) {
        self.session.reset();
    }

    /// Start of the order-history window for attributing the current trade,
    /// `None` without an entry time
    pub fn outcome_window_start(&self, lookback: Duration) -> Option<DateTime<Utc>> {
        self.session.opened_at.map(|opened_at| opened_at - lookback)
    }
}

/// Decide TP vs SL from filled reduce-only protective orders.
///
/// Latest activity wins; on an exact tie the take-profit wins.
pub fn attribute_outcome(orders: &[HistoricalOrder]) -> TradeOutcome {
    let latest = |order_type: OrderType| {
        orders
            .iter()
            .filter(|o| {
                o.reduce_only && o.status == OrderStatus::Filled && o.order_type == order_type
            })
            .map(HistoricalOrder::last_activity)
            .max()
    };

    match (latest(OrderType::TakeProfitMarket), latest(OrderType::StopMarket)) {
        (Some(tp), Some(sl)) if tp >= sl => TradeOutcome::TakeProfit,
        (Some(_), Some(_)) => TradeOutcome::StopLoss,
        (Some(_), None) => TradeOutcome::TakeProfit,
        (None, Some(_)) => TradeOutcome::StopLoss,
        (None, None) => TradeOutcome::Unknown,
    }
}
