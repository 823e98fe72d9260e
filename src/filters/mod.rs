// Exchange grid quantization and the symbol filter cache
use rust_decimal::{Decimal, RoundingStrategy};
use std::sync::{PoisonError, RwLock};

use crate::api::Exchange;
use crate::models::SymbolFilters;

/// Upper bound for fractional digits counted on a step
const MAX_DECIMAL_PLACES: u32 = 12;

/// Count fractional digits of `step` (0.01 -> 2, 1 -> 0), capped at 12
pub fn decimal_places(step: Decimal) -> u32 {
    let mut d = step.abs();
    let mut places = 0;

    while d != d.trunc() && places < MAX_DECIMAL_PLACES {
        d = match d.checked_mul(Decimal::TEN) {
            Some(next) => next,
            None => break,
        };
        places += 1;
    }

    places
}

/// Round `value` to the nearest multiple of `step` (half away from zero).
/// A non-positive step leaves the value untouched.
pub fn round_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }

    let factor = (value / step).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    (factor * step)
        .round_dp_with_strategy(decimal_places(step), RoundingStrategy::MidpointAwayFromZero)
}

/// Round `value` down to a multiple of `step`.
/// A non-positive step leaves the value untouched.
pub fn round_down_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }

    let floored = (value / step).floor() * step;
    floored.round_dp_with_strategy(decimal_places(step), RoundingStrategy::MidpointAwayFromZero)
}

/// Last-good copy of the symbol's exchange filters
///
/// Refresh failures keep the previous value, so the bot can keep quantizing
/// through a flaky exchange-info endpoint.
#[derive(Debug, Default)]
pub struct SymbolFilterCache {
    inner: RwLock<SymbolFilters>,
}

impl SymbolFilterCache {
    pub fn new(initial: SymbolFilters) -> Self {
        Self {
            inner: RwLock::new(initial),
        }
    }

    pub fn snapshot(&self) -> SymbolFilters {
        *self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fetch fresh filters; returns whether the refresh succeeded
    pub async fn refresh(&self, exchange: &dyn Exchange, symbol: &str) -> bool {
        match exchange.symbol_filters(symbol).await {
            Ok(filters)
                if filters.price_tick > Decimal::ZERO && filters.qty_step > Decimal::ZERO =>
            {
                tracing::debug!(
                    "Filters for {}: tick={} step={} minNotional={}",
                    symbol,
                    filters.price_tick,
                    filters.qty_step,
                    filters.min_notional
                );
                *self.inner.write().unwrap_or_else(PoisonError::into_inner) = filters;
                true
            }
            Ok(filters) => {
                tracing::warn!(
                    "Ignoring invalid filters for {} (tick={}, step={}), keeping last good",
                    symbol,
                    filters.price_tick,
                    filters.qty_step
                );
                false
            }
            Err(e) => {
                tracing::warn!("Filter refresh for {} failed, keeping last good: {}", symbol, e);
                false
            }
        }
    }

    /// Render a price with the tick's decimal places
    pub fn format_price(&self, value: Decimal) -> String {
        let places = self.snapshot().price_decimal_places();
        format!("{:.*}", places as usize, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::stub::StubExchange;
    use rust_decimal_macros::dec;

    #[test]
    fn test_decimal_places() {
        assert_eq!(decimal_places(dec!(0.01)), 2);
        assert_eq!(decimal_places(dec!(1)), 0);
        assert_eq!(decimal_places(dec!(0.0010)), 3);
        assert_eq!(decimal_places(dec!(0.5)), 1);
    }

    #[test]
    fn test_decimal_places_capped() {
        assert_eq!(decimal_places(dec!(0.00000000000000000001)), 12);
    }

    #[test]
    fn test_round_down_to_step() {
        assert_eq!(round_down_to_step(dec!(0.12345), dec!(0.001)), dec!(0.123));
        assert_eq!(round_down_to_step(dec!(0.1239), dec!(0.001)), dec!(0.123));
        assert_eq!(round_down_to_step(dec!(7), dec!(2)), dec!(6));
    }

    #[test]
    fn test_round_to_step_half_away_from_zero() {
        assert_eq!(round_to_step(dec!(100.17), dec!(0.1)), dec!(100.2));
        assert_eq!(round_to_step(dec!(100.15), dec!(0.1)), dec!(100.2));
        assert_eq!(round_to_step(dec!(100.14), dec!(0.1)), dec!(100.1));
        assert_eq!(round_to_step(dec!(-0.15), dec!(0.1)), dec!(-0.2));
    }

    #[test]
    fn test_rounding_is_idempotent() {
        let once = round_to_step(dec!(100.17), dec!(0.1));
        assert_eq!(round_to_step(once, dec!(0.1)), once);

        let down = round_down_to_step(dec!(0.12345), dec!(0.001));
        assert_eq!(round_down_to_step(down, dec!(0.001)), down);

        let odd_step = round_to_step(dec!(27123.456), dec!(0.25));
        assert_eq!(odd_step, dec!(27123.5));
        assert_eq!(round_to_step(odd_step, dec!(0.25)), odd_step);
    }

    #[test]
    fn test_non_positive_step_is_noop() {
        assert_eq!(round_to_step(dec!(1.2345), Decimal::ZERO), dec!(1.2345));
        assert_eq!(round_down_to_step(dec!(1.2345), dec!(-0.1)), dec!(1.2345));
    }

    #[tokio::test]
    async fn test_cache_keeps_last_good_on_failure() {
        let exchange = StubExchange::new("BTCUSDT");
        let cache = SymbolFilterCache::default();

        let fresh = SymbolFilters {
            price_tick: dec!(0.1),
            qty_step: dec!(0.001),
            min_notional: dec!(100),
        };
        exchange.set_filters(fresh);
        assert!(cache.refresh(&exchange, "BTCUSDT").await);
        assert_eq!(cache.snapshot(), fresh);

        exchange.fail_filters(true);
        assert!(!cache.refresh(&exchange, "BTCUSDT").await);
        assert_eq!(cache.snapshot(), fresh);
    }

    #[test]
    fn test_format_price_uses_tick_places() {
        let cache = SymbolFilterCache::new(SymbolFilters {
            price_tick: dec!(0.1),
            ..SymbolFilters::default()
        });
        assert_eq!(cache.format_price(dec!(100.2)), "100.2");
        assert_eq!(cache.format_price(dec!(100)), "100.0");
    }
}
