// Trading strategy module
pub mod crossover;

pub use crossover::{CrossSignal, Detection, EmaCrossStrategy, Evaluation};

use chrono::{DateTime, Utc};

use crate::models::Candle;

/// Base trait for signal generators driven by the trading loop
pub trait Strategy: Send + Sync {
    /// Classify the latest closed candle. Must be stateless per call.
    fn evaluate(&self, candles: &[Candle], now: DateTime<Utc>) -> Detection;

    /// Get strategy name
    fn name(&self) -> &str;

    /// Minimum closed candles required for a signal
    fn min_candles_required(&self) -> usize;
}
