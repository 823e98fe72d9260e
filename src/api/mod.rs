//! Exchange boundary.
//!
//! The trading core only talks to the exchange through [`Exchange`]. The
//! Binance USDⓈ-M adapter lives in [`binance`]; [`stub`] is an in-memory
//! exchange for tests and dry runs.

pub mod binance;
pub mod stub;

pub use binance::BinanceFuturesClient;
pub use stub::StubExchange;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::models::{
    Candle, HistoricalOrder, OpenOrder, OrderRequest, SymbolFilters, WalletBalance,
};

/// Errors surfaced by exchange adapters
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExchangeError {
    #[error("HTTP request failed: {0}")]
    Request(String),

    #[error("Exchange API error: {code} - {msg}")]
    Api { code: i64, msg: String },

    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Failed to sign request: {0}")]
    Signature(String),

    /// The exchange does not offer this operation
    #[error("Operation not supported: {0}")]
    Unsupported(String),
}

/// Result of probing the optional position-mode capability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionModeProbe {
    Unsupported,
    OneWay,
    Hedge,
}

impl PositionModeProbe {
    pub fn is_supported(self) -> bool {
        !matches!(self, PositionModeProbe::Unsupported)
    }
}

/// Operations the trading core consumes from a futures exchange
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Most recent candles, oldest first
    async fn recent_candles(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError>;

    /// Current mark price, `None` when the exchange has none to report
    async fn mark_price(&self, symbol: &str) -> Result<Option<Decimal>, ExchangeError>;

    /// Signed position quantity (0 = flat, sign = side)
    async fn position_quantity(&self, symbol: &str) -> Result<Decimal, ExchangeError>;

    async fn open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError>;

    async fn order_history(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<HistoricalOrder>, ExchangeError>;

    /// Submit an order, returning the exchange order id
    async fn place_order(&self, request: &OrderRequest) -> Result<i64, ExchangeError>;

    async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<(), ExchangeError>;

    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError>;

    async fn wallet_balance(&self, asset: &str) -> Result<WalletBalance, ExchangeError>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError>;

    async fn set_isolated_margin(&self, symbol: &str) -> Result<(), ExchangeError>;

    /// Probe the optional position-mode endpoint
    async fn probe_position_mode(&self) -> Result<PositionModeProbe, ExchangeError> {
        Ok(PositionModeProbe::Unsupported)
    }

    async fn set_one_way_mode(&self) -> Result<(), ExchangeError> {
        Err(ExchangeError::Unsupported("position mode".to_string()))
    }
}
