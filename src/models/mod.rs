use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed-ness grace period when the exchange does not flag final candles
const CANDLE_CLOSE_GRACE_SECS: i64 = 1;

/// OHLC candle as delivered by the exchange (only the fields the bot reads)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub close: Decimal,
    /// Exchange-provided "final" flag, when the feed has one
    pub is_final: Option<bool>,
}

impl Candle {
    /// A candle is closed if the exchange marks it final, or (without a flag)
    /// once its close time has fully elapsed.
    pub fn is_closed_at(&self, now: DateTime<Utc>) -> bool {
        match self.is_final {
            Some(flag) => flag,
            None => self.close_time <= now - Duration::seconds(CANDLE_CLOSE_GRACE_SECS),
        }
    }
}

/// Direction of an open position
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Side implied by a signed position quantity (0 = flat)
    pub fn from_quantity(qty: Decimal) -> Option<Side> {
        if qty > Decimal::ZERO {
            Some(Side::Long)
        } else if qty < Decimal::ZERO {
            Some(Side::Short)
        } else {
            None
        }
    }

    /// Order side that opens this position
    pub fn entry_order_side(self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces this position
    pub fn closing_order_side(self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Sell,
            Side::Short => OrderSide::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => write!(f, "Long"),
            Side::Short => write!(f, "Short"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
    TakeProfitMarket,
    StopMarket,
    #[serde(other)]
    Other,
}

impl OrderType {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::TakeProfitMarket => "TAKE_PROFIT_MARKET",
            OrderType::StopMarket => "STOP_MARKET",
            OrderType::Other => "OTHER",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Expired,
    Rejected,
    #[serde(other)]
    Other,
}

/// Currently working order on the exchange
#[derive(Debug, Clone, PartialEq)]
pub struct OpenOrder {
    pub id: i64,
    pub order_type: OrderType,
    pub reduce_only: bool,
}

/// Order from the account's order history
#[derive(Debug, Clone, PartialEq)]
pub struct HistoricalOrder {
    pub id: i64,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub reduce_only: bool,
    pub create_time: Option<DateTime<Utc>>,
    pub update_time: Option<DateTime<Utc>>,
}

impl HistoricalOrder {
    /// Latest of update/create time; missing timestamps sort oldest
    pub fn last_activity(&self) -> DateTime<Utc> {
        let created = self.create_time.unwrap_or(DateTime::<Utc>::MIN_UTC);
        let updated = self.update_time.unwrap_or(DateTime::<Utc>::MIN_UTC);
        created.max(updated)
    }
}

// Binance caps client order ids at 36 chars
fn client_order_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("emabot-{}", &id[..24])
}

/// Order submission
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub stop_price: Option<Decimal>,
    pub reduce_only: bool,
    pub client_order_id: String,
}

impl OrderRequest {
    fn new(symbol: &str, side: OrderSide, order_type: OrderType, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type,
            quantity,
            stop_price: None,
            reduce_only: false,
            client_order_id: client_order_id(),
        }
    }

    /// Position-opening market order
    pub fn market(symbol: &str, side: OrderSide, quantity: Decimal) -> Self {
        Self::new(symbol, side, OrderType::Market, quantity)
    }

    /// Reduce-only market order used to flatten a position
    pub fn close_market(symbol: &str, side: OrderSide, quantity: Decimal) -> Self {
        Self {
            reduce_only: true,
            ..Self::new(symbol, side, OrderType::Market, quantity)
        }
    }

    /// Reduce-only trigger order (take-profit-market or stop-market)
    pub fn protective(
        symbol: &str,
        side: OrderSide,
        order_type: OrderType,
        quantity: Decimal,
        stop_price: Decimal,
    ) -> Self {
        Self {
            stop_price: Some(stop_price),
            reduce_only: true,
            ..Self::new(symbol, side, order_type, quantity)
        }
    }
}

/// Exchange grid rules for the traded symbol
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SymbolFilters {
    pub price_tick: Decimal,
    pub qty_step: Decimal,
    pub min_notional: Decimal,
}

impl SymbolFilters {
    pub fn price_decimal_places(&self) -> u32 {
        crate::filters::decimal_places(self.price_tick)
    }
}

impl Default for SymbolFilters {
    fn default() -> Self {
        Self {
            price_tick: Decimal::new(1, 2),   // 0.01
            qty_step: Decimal::new(1, 3),     // 0.001
            min_notional: Decimal::new(5, 0), // 5 USDT
        }
    }
}

/// Futures wallet balances for the margin asset
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct WalletBalance {
    pub wallet_balance: Option<Decimal>,
    pub available_balance: Option<Decimal>,
}

/// The bot's belief of its own open position
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SessionState {
    pub side: Option<Side>,
    pub entry_price: Option<Decimal>,
    pub entry_qty: Option<Decimal>,
    pub opened_at: Option<DateTime<Utc>>,
    pub planned_take_profit: Option<Decimal>,
    /// Close time of the last candle an entry was attempted on
    pub last_processed_candle_close_time: Option<DateTime<Utc>>,
}

impl SessionState {
    /// Back to flat. The processed-candle marker is kept so a close never
    /// re-arms entry on the same candle.
    pub fn reset(&mut self) {
        self.side = None;
        self.entry_price = None;
        self.entry_qty = None;
        self.opened_at = None;
        self.planned_take_profit = None;
    }

    pub fn is_flat(&self) -> bool {
        self.side.is_none()
    }
}

/// Cumulative trade outcome counters
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct TradingStats {
    pub trades_total: u32,
    pub wins: u32,
    pub losses: u32,
}

impl TradingStats {
    /// Win rate in percent (0 when no trades)
    pub fn win_rate(&self) -> Decimal {
        if self.trades_total == 0 {
            return Decimal::ZERO;
        }
        Decimal::from(self.wins) / Decimal::from(self.trades_total) * Decimal::ONE_HUNDRED
    }

    pub fn record(&mut self, outcome: TradeOutcome) {
        self.trades_total += 1;
        match outcome {
            TradeOutcome::TakeProfit => self.wins += 1,
            TradeOutcome::StopLoss => self.losses += 1,
            TradeOutcome::Unknown => {}
        }
    }
}

/// How a closed position ended
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum TradeOutcome {
    TakeProfit,
    StopLoss,
    Unknown,
}

impl fmt::Display for TradeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeOutcome::TakeProfit => write!(f, "TP"),
            TradeOutcome::StopLoss => write!(f, "SL"),
            TradeOutcome::Unknown => write!(f, "Unknown"),
        }
    }
}
