use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::indicators::calculate_ema_series;
use crate::models::{Candle, Side};
use crate::strategy::Strategy;

/// Fast/slow EMA crossover classification of the latest closed candle
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum CrossSignal {
    CrossUp,
    CrossDown,
    None,
}

impl CrossSignal {
    /// Position side this signal would open
    pub fn entry_side(self) -> Option<Side> {
        match self {
            CrossSignal::CrossUp => Some(Side::Long),
            CrossSignal::CrossDown => Some(Side::Short),
            CrossSignal::None => None,
        }
    }
}

/// Result of evaluating a closed-candle window
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Evaluation {
    pub signal: CrossSignal,
    pub candle_close_time: DateTime<Utc>,
    pub last_close: Decimal,
    pub last_fast: Decimal,
    pub last_slow: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    InsufficientData { have: usize, need: usize },
    Ready(Evaluation),
}

/// Previous tick at-or-below, current tick strictly above
pub fn crossed_up(prev_fast: Decimal, prev_slow: Decimal, fast: Decimal, slow: Decimal) -> bool {
    prev_fast <= prev_slow && fast > slow
}

/// Previous tick at-or-above, current tick strictly below
pub fn crossed_down(prev_fast: Decimal, prev_slow: Decimal, fast: Decimal, slow: Decimal) -> bool {
    prev_fast >= prev_slow && fast < slow
}

/// Classify the crossover on the last two points of aligned EMA series
pub fn classify(fast: &[Decimal], slow: &[Decimal]) -> CrossSignal {
    let n = fast.len().min(slow.len());
    if n < 2 {
        return CrossSignal::None;
    }

    let (prev_fast, prev_slow) = (fast[n - 2], slow[n - 2]);
    let (last_fast, last_slow) = (fast[n - 1], slow[n - 1]);

    if crossed_up(prev_fast, prev_slow, last_fast, last_slow) {
        CrossSignal::CrossUp
    } else if crossed_down(prev_fast, prev_slow, last_fast, last_slow) {
        CrossSignal::CrossDown
    } else {
        CrossSignal::None
    }
}

/// Stateless EMA crossover detector over closed candles
#[derive(Debug, Clone)]
pub struct EmaCrossStrategy {
    fast_period: usize,
    slow_period: usize,
}

impl EmaCrossStrategy {
    pub fn new(fast_period: usize, slow_period: usize) -> Self {
        Self {
            fast_period,
            slow_period,
        }
    }

    /// Evaluate a series of closed-candle close prices.
    /// `close_time` is the close time of the last candle in `closes`.
    pub fn detect(&self, closes: &[Decimal], close_time: DateTime<Utc>) -> Detection {
        let need = self.min_candles_required();
        if closes.len() < need {
            return Detection::InsufficientData {
                have: closes.len(),
                need,
            };
        }

        let fast = calculate_ema_series(closes, self.fast_period);
        let slow = calculate_ema_series(closes, self.slow_period);
        let n = closes.len();

        Detection::Ready(Evaluation {
            signal: classify(&fast, &slow),
            candle_close_time: close_time,
            last_close: closes[n - 1],
            last_fast: fast[n - 1],
            last_slow: slow[n - 1],
        })
    }
}

impl Strategy for EmaCrossStrategy {
    fn evaluate(&self, candles: &[Candle], now: DateTime<Utc>) -> Detection {
        let closed: Vec<&Candle> = candles.iter().filter(|c| c.is_closed_at(now)).collect();

        let Some(last) = closed.last() else {
            return Detection::InsufficientData {
                have: 0,
                need: self.min_candles_required(),
            };
        };

        let closes: Vec<Decimal> = closed.iter().map(|c| c.close).collect();
        self.detect(&closes, last.close_time)
    }

    fn name(&self) -> &str {
        "ema_cross"
    }

    fn min_candles_required(&self) -> usize {
        self.slow_period.max(self.fast_period) + 2
    }
}
