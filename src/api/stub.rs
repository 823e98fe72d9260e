//! In-memory exchange for tests and dry runs.
//!
//! Market orders fill immediately at the configured mark price, protective
//! orders rest as open reduce-only orders until cancelled or filled by hand.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::api::{Exchange, ExchangeError, PositionModeProbe};
use crate::models::{
    Candle, HistoricalOrder, OpenOrder, OrderRequest, OrderSide, OrderStatus, OrderType,
    SymbolFilters, WalletBalance,
};

#[derive(Debug, Default)]
struct StubState {
    candles: Vec<Candle>,
    mark_price: Option<Decimal>,
    position_qty: Decimal,
    open_orders: Vec<OpenOrder>,
    history: Vec<HistoricalOrder>,
    filters: SymbolFilters,
    balance: WalletBalance,
    position_mode: Option<PositionModeProbe>,
    next_order_id: i64,
    placed: Vec<OrderRequest>,
    cancelled: Vec<i64>,
    leverage: Option<u32>,
    isolated: bool,
    one_way_switches: u32,
    position_mode_probes: u32,
    rejected_types: HashSet<OrderTypeKey>,
    fail_candles: bool,
    fail_position: bool,
    fail_filters: bool,
    fail_balance: bool,
    fail_cancel: bool,
}

// OrderType is not Hash; key rejected types by their wire name
type OrderTypeKey = &'static str;

/// Stub exchange for testing
pub struct StubExchange {
    symbol: String,
    state: Mutex<StubState>,
}

impl StubExchange {
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            state: Mutex::new(StubState {
                next_order_id: 1,
                position_mode: Some(PositionModeProbe::OneWay),
                ..StubState::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, StubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_symbol(&self, symbol: &str) -> Result<(), ExchangeError> {
        if symbol == self.symbol {
            Ok(())
        } else {
            Err(ExchangeError::Api {
                code: -1121,
                msg: format!("Invalid symbol {}", symbol),
            })
        }
    }

    // ============== Scenario setup ==============

    pub fn set_candles(&self, candles: Vec<Candle>) {
        self.state().candles = candles;
    }

    pub fn set_mark_price(&self, price: Option<Decimal>) {
        self.state().mark_price = price;
    }

    pub fn set_position(&self, qty: Decimal) {
        self.state().position_qty = qty;
    }

    pub fn set_filters(&self, filters: SymbolFilters) {
        self.state().filters = filters;
    }

    pub fn set_balance(&self, wallet: Decimal, available: Decimal) {
        self.state().balance = WalletBalance {
            wallet_balance: Some(wallet),
            available_balance: Some(available),
        };
    }

    pub fn set_history(&self, history: Vec<HistoricalOrder>) {
        self.state().history = history;
    }

    pub fn set_position_mode(&self, probe: PositionModeProbe) {
        self.state().position_mode = Some(probe);
    }

    /// Add a resting order as if placed outside the bot
    pub fn add_open_order(&self, order_type: OrderType, reduce_only: bool) -> i64 {
        let mut state = self.state();
        let id = state.next_order_id;
        state.next_order_id += 1;
        state.open_orders.push(OpenOrder {
            id,
            order_type,
            reduce_only,
        });
        id
    }

    /// Drop a resting order without recording a cancel (exchange-side expiry)
    pub fn expire_order(&self, order_id: i64) {
        self.state().open_orders.retain(|o| o.id != order_id);
    }

    pub fn reject_order_type(&self, order_type: OrderType) {
        self.state().rejected_types.insert(order_type.as_str());
    }

    pub fn accept_all_orders(&self) {
        self.state().rejected_types.clear();
    }

    pub fn fail_candles(&self, fail: bool) {
        self.state().fail_candles = fail;
    }

    pub fn fail_position(&self, fail: bool) {
        self.state().fail_position = fail;
    }

    pub fn fail_filters(&self, fail: bool) {
        self.state().fail_filters = fail;
    }

    pub fn fail_balance(&self, fail: bool) {
        self.state().fail_balance = fail;
    }

    pub fn fail_cancel(&self, fail: bool) {
        self.state().fail_cancel = fail;
    }

    // ============== Inspection ==============

    pub fn placed_orders(&self) -> Vec<OrderRequest> {
        self.state().placed.clone()
    }

    pub fn current_open_orders(&self) -> Vec<OpenOrder> {
        self.state().open_orders.clone()
    }

    pub fn cancelled_orders(&self) -> Vec<i64> {
        self.state().cancelled.clone()
    }

    pub fn position(&self) -> Decimal {
        self.state().position_qty
    }

    pub fn leverage(&self) -> Option<u32> {
        self.state().leverage
    }

    pub fn is_isolated(&self) -> bool {
        self.state().isolated
    }

    pub fn one_way_switches(&self) -> u32 {
        self.state().one_way_switches
    }

    pub fn position_mode_probes(&self) -> u32 {
        self.state().position_mode_probes
    }
}

#[async_trait]
impl Exchange for StubExchange {
    async fn recent_candles(
        &self,
        symbol: &str,
        _interval: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        self.check_symbol(symbol)?;
        let state = self.state();
        if state.fail_candles {
            return Err(ExchangeError::Timeout);
        }
        let skip = state.candles.len().saturating_sub(limit as usize);
        Ok(state.candles[skip..].to_vec())
    }

    async fn mark_price(&self, symbol: &str) -> Result<Option<Decimal>, ExchangeError> {
        self.check_symbol(symbol)?;
        Ok(self.state().mark_price)
    }

    async fn position_quantity(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        self.check_symbol(symbol)?;
        let state = self.state();
        if state.fail_position {
            return Err(ExchangeError::Request("simulated position failure".to_string()));
        }
        Ok(state.position_qty)
    }

    async fn open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError> {
        self.check_symbol(symbol)?;
        Ok(self.state().open_orders.clone())
    }

    async fn order_history(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<HistoricalOrder>, ExchangeError> {
        self.check_symbol(symbol)?;
        Ok(self
            .state()
            .history
            .iter()
            .filter(|o| {
                let t = o.last_activity();
                t >= from && t <= to
            })
            .cloned()
            .collect())
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<i64, ExchangeError> {
        self.check_symbol(&request.symbol)?;
        let mut state = self.state();

        if state.rejected_types.contains(request.order_type.as_str()) {
            return Err(ExchangeError::Api {
                code: -2021,
                msg: "Order would immediately trigger.".to_string(),
            });
        }

        let id = state.next_order_id;
        state.next_order_id += 1;
        state.placed.push(request.clone());

        match request.order_type {
            OrderType::Market => {
                let signed = match request.side {
                    OrderSide::Buy => request.quantity,
                    OrderSide::Sell => -request.quantity,
                };
                if request.reduce_only {
                    state.position_qty = Decimal::ZERO;
                } else {
                    state.position_qty += signed;
                }
            }
            order_type => state.open_orders.push(OpenOrder {
                id,
                order_type,
                reduce_only: request.reduce_only,
            }),
        }

        Ok(id)
    }

    async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<(), ExchangeError> {
        self.check_symbol(symbol)?;
        let mut state = self.state();
        if state.fail_cancel {
            return Err(ExchangeError::Api {
                code: -2011,
                msg: "Unknown order sent.".to_string(),
            });
        }
        state.open_orders.retain(|o| o.id != order_id);
        state.cancelled.push(order_id);
        Ok(())
    }

    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError> {
        self.check_symbol(symbol)?;
        let state = self.state();
        if state.fail_filters {
            return Err(ExchangeError::Timeout);
        }
        Ok(state.filters)
    }

    async fn wallet_balance(&self, _asset: &str) -> Result<WalletBalance, ExchangeError> {
        let state = self.state();
        if state.fail_balance {
            return Err(ExchangeError::Timeout);
        }
        Ok(state.balance)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        self.check_symbol(symbol)?;
        self.state().leverage = Some(leverage);
        Ok(())
    }

    async fn set_isolated_margin(&self, symbol: &str) -> Result<(), ExchangeError> {
        self.check_symbol(symbol)?;
        self.state().isolated = true;
        Ok(())
    }

    async fn probe_position_mode(&self) -> Result<PositionModeProbe, ExchangeError> {
        let mut state = self.state();
        state.position_mode_probes += 1;
        Ok(state.position_mode.unwrap_or(PositionModeProbe::Unsupported))
    }

    async fn set_one_way_mode(&self) -> Result<(), ExchangeError> {
        let mut state = self.state();
        match state.position_mode {
            Some(PositionModeProbe::Unsupported) | None => {
                Err(ExchangeError::Unsupported("position mode".to_string()))
            }
            Some(_) => {
                state.position_mode = Some(PositionModeProbe::OneWay);
                state.one_way_switches += 1;
                Ok(())
            }
        }
    }
}

/// Filled reduce-only order for outcome-attribution scenarios
pub fn filled_reduce_only(
    id: i64,
    order_type: OrderType,
    update_time: DateTime<Utc>,
) -> HistoricalOrder {
    HistoricalOrder {
        id,
        order_type,
        status: OrderStatus::Filled,
        reduce_only: true,
        create_time: Some(update_time),
        update_time: Some(update_time),
    }
}
