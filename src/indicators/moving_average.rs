use rust_decimal::Decimal;

/// Calculate Simple Moving Average (SMA) over the last `period` prices
pub fn calculate_sma(prices: &[Decimal], period: usize) -> Option<Decimal> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let sum: Decimal = prices.iter().rev().take(period).sum();
    Some(sum / Decimal::from(period))
}

/// Calculate an Exponential Moving Average (EMA) series aligned with `prices`
///
/// Indices `[0, period)` carry the raw prices so the output can be indexed
/// exactly like the input. The recurrence starts at `period`, seeded with the
/// SMA of the first `period` prices. `period <= 1` is the identity.
pub fn calculate_ema_series(prices: &[Decimal], period: usize) -> Vec<Decimal> {
    if period <= 1 {
        return prices.to_vec();
    }

    // Not enough data to seed
    let Some(mut prev) = calculate_sma(&prices[..period.min(prices.len())], period) else {
        return prices.to_vec();
    };

    let multiplier = Decimal::TWO / Decimal::from(period + 1);
    let mut ema = Vec::with_capacity(prices.len());

    for (i, price) in prices.iter().enumerate() {
        if i < period {
            ema.push(*price);
        } else {
            let current = *price * multiplier + prev * (Decimal::ONE - multiplier);
            ema.push(current);
            prev = current;
        }
    }

    ema
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_sma() {
        let prices = vec![dec!(100), dec!(102), dec!(104), dec!(106), dec!(108)];
        assert_eq!(calculate_sma(&prices, 5), Some(dec!(104)));
    }

    #[test]
    fn test_sma_insufficient_data() {
        let prices = vec![dec!(100), dec!(102)];
        assert!(calculate_sma(&prices, 5).is_none());
    }

    #[test]
    fn test_ema_identity_for_short_period() {
        let prices = vec![dec!(1.5), dec!(2), dec!(0.25), dec!(9)];
        assert_eq!(calculate_ema_series(&prices, 1), prices);
        assert_eq!(calculate_ema_series(&prices, 0), prices);
    }

    #[test]
    fn test_ema_constant_series() {
        let prices = vec![dec!(42.5); 12];
        for period in [3, 4] {
            let ema = calculate_ema_series(&prices, period);
            assert_eq!(ema.len(), prices.len());
            assert!(ema.iter().all(|v| *v == dec!(42.5)));
        }
    }

    #[test]
    fn test_ema_seed_and_recurrence() {
        // period 3 -> k = 0.5, seed = mean(1, 2, 3) = 2
        let prices = vec![dec!(1), dec!(2), dec!(3), dec!(6), dec!(10)];
        let ema = calculate_ema_series(&prices, 3);

        assert_eq!(&ema[..3], &prices[..3]);
        assert_eq!(ema[3], dec!(4)); // 6*0.5 + 2*0.5
        assert_eq!(ema[4], dec!(7)); // 10*0.5 + 4*0.5
    }

    #[test]
    fn test_ema_too_few_prices_returns_raw() {
        let prices = vec![dec!(1), dec!(2)];
        assert_eq!(calculate_ema_series(&prices, 5), prices);
    }
}
