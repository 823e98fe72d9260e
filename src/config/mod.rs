// Bot configuration: compiled-in defaults, overridden by EMABOT_* env vars
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

const ENV_PREFIX: &str = "EMABOT";
const MAX_LEVERAGE: u32 = 125;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Strategy and runtime settings for a single-symbol bot
#[derive(Clone, Serialize, Deserialize)]
pub struct BotConfig {
    pub symbol: String,
    /// Kline interval, e.g. "1h"
    pub interval: String,
    /// Margin asset whose balance sizes positions
    pub margin_asset: String,
    pub leverage: u32,
    pub ema_fast: usize,
    pub ema_slow: usize,
    /// Take-profit distance from reference price (0.005 = 0.5%)
    pub take_profit_pct: Decimal,
    /// Stop-loss distance from reference price (0.001 = 0.1%)
    pub stop_loss_pct: Decimal,
    /// Share of available balance committed as margin
    pub margin_use_ratio: Decimal,
    /// Minimum distance of trigger prices from mark, as a fraction of mark
    pub mark_buffer_pct: Decimal,
    /// Candles fetched per tick
    pub candle_limit: u32,
    pub tick_interval_ms: u64,
    /// History lookback before the entry time when attributing a close
    pub outcome_lookback_minutes: i64,
    pub testnet: bool,
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            interval: "1h".to_string(),
            margin_asset: "USDT".to_string(),
            leverage: 20,
            ema_fast: 1,
            ema_slow: 24,
            take_profit_pct: Decimal::new(5, 3), // 0.5%
            stop_loss_pct: Decimal::new(1, 3),   // 0.1%
            margin_use_ratio: Decimal::new(92, 2),
            mark_buffer_pct: Decimal::new(3, 4),
            candle_limit: 300,
            tick_interval_ms: 1000,
            outcome_lookback_minutes: 5,
            testnet: false,
            base_url: None,
            api_key: String::new(),
            api_secret: String::new(),
        }
    }
}

// Credentials stay out of logs
impl fmt::Debug for BotConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BotConfig")
            .field("symbol", &self.symbol)
            .field("interval", &self.interval)
            .field("leverage", &self.leverage)
            .field("ema_fast", &self.ema_fast)
            .field("ema_slow", &self.ema_slow)
            .field("take_profit_pct", &self.take_profit_pct)
            .field("stop_loss_pct", &self.stop_loss_pct)
            .field("margin_use_ratio", &self.margin_use_ratio)
            .field("testnet", &self.testnet)
            .field("has_credentials", &self.has_credentials())
            .finish_non_exhaustive()
    }
}

impl BotConfig {
    /// Load defaults, then `EMABOT_*` overrides, then Binance credentials
    /// from `BINANCE_API_KEY` / `BINANCE_API_SECRET`.
    ///
    /// Call `dotenvy::dotenv()` first to pick up a `.env` file.
    pub fn load() -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&BotConfig::default())?)
            .add_source(config::Environment::with_prefix(ENV_PREFIX))
            .set_override_option("api_key", std::env::var("BINANCE_API_KEY").ok())?
            .set_override_option("api_secret", std::env::var("BINANCE_API_SECRET").ok())?
            .build()?;

        let config: BotConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.symbol.trim().is_empty() {
            return invalid("symbol must not be empty".to_string());
        }
        if self.ema_fast == 0 || self.ema_slow <= self.ema_fast {
            return invalid(format!(
                "EMA periods must satisfy 0 < fast < slow (got {}/{})",
                self.ema_fast, self.ema_slow
            ));
        }
        if self.take_profit_pct <= Decimal::ZERO || self.stop_loss_pct <= Decimal::ZERO {
            return invalid("take-profit and stop-loss percentages must be positive".to_string());
        }
        if self.stop_loss_pct >= Decimal::ONE {
            return invalid(format!("stop-loss {} would cross zero", self.stop_loss_pct));
        }
        if self.margin_use_ratio <= Decimal::ZERO || self.margin_use_ratio > Decimal::ONE {
            return invalid(format!(
                "margin_use_ratio must be in (0, 1] (got {})",
                self.margin_use_ratio
            ));
        }
        if self.mark_buffer_pct < Decimal::ZERO {
            return invalid("mark_buffer_pct must not be negative".to_string());
        }
        if self.leverage == 0 || self.leverage > MAX_LEVERAGE {
            return invalid(format!(
                "leverage must be 1..={} (got {})",
                MAX_LEVERAGE, self.leverage
            ));
        }
        if (self.candle_limit as usize) < self.ema_slow + 2 {
            return invalid(format!(
                "candle_limit {} cannot cover slow EMA {} + 2",
                self.candle_limit, self.ema_slow
            ));
        }
        if self.tick_interval_ms == 0 {
            return invalid("tick_interval_ms must be positive".to_string());
        }

        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.api_secret.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_defaults_are_valid() {
        let config = BotConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.take_profit_pct, dec!(0.005));
        assert_eq!(config.stop_loss_pct, dec!(0.001));
        assert_eq!(config.margin_use_ratio, dec!(0.92));
        assert_eq!(config.tick_interval(), Duration::from_secs(1));
        assert!(!config.has_credentials());
    }

    #[test]
    fn test_rejects_inverted_ema_periods() {
        let config = BotConfig {
            ema_fast: 24,
            ema_slow: 24,
            ..BotConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_short_candle_window() {
        let config = BotConfig {
            candle_limit: 25,
            ..BotConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_margin_ratio() {
        let config = BotConfig {
            margin_use_ratio: dec!(1.5),
            ..BotConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_applies_env_overrides() {
        std::env::set_var("EMABOT_EMA_SLOW", "30");
        std::env::set_var("EMABOT_TAKE_PROFIT_PCT", "0.01");

        let config = BotConfig::load().expect("config");

        std::env::remove_var("EMABOT_EMA_SLOW");
        std::env::remove_var("EMABOT_TAKE_PROFIT_PCT");

        assert_eq!(config.ema_slow, 30);
        assert_eq!(config.take_profit_pct, dec!(0.01));
        assert_eq!(config.symbol, "BTCUSDT");
    }
}
