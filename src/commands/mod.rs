// Text command surface over the trading engine
use rust_decimal::{Decimal, RoundingStrategy};
use std::sync::Arc;

use crate::execution::{EngineError, TradingEngine, WalletService};

fn fmt2(value: Option<Decimal>) -> String {
    value
        .map(|v| v.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero).to_string())
        .unwrap_or_else(|| "?".to_string())
}

fn pct(fraction: Decimal) -> Decimal {
    (fraction * Decimal::ONE_HUNDRED).normalize()
}

pub struct CommandHandler {
    engine: Arc<TradingEngine>,
    wallet: Arc<WalletService>,
}

impl CommandHandler {
    pub fn new(engine: Arc<TradingEngine>) -> Self {
        let wallet = engine.wallet();
        Self { engine, wallet }
    }

    pub fn help_text(&self) -> String {
        let config = self.engine.config();
        format!(
            "EMA Futures Bot ({} {})\n\n\
             /startbot - start trading\n\
             /stopbot - stop trading\n\
             /stopsession - close the current position\n\
             /status - engine state\n\
             /stats - trade statistics\n\
             /balance - wallet\n\
             /settings - active settings",
            config.symbol, config.interval
        )
    }

    /// Dispatch one command line. Never fails; errors come back as text.
    pub async fn handle(&self, raw: &str) -> String {
        let text = raw.trim().to_lowercase();

        match text.as_str() {
            "/start" | "/help" => self.help_text(),
            "/startbot" => match self.engine.start().await {
                Ok(()) => {
                    let config = self.engine.config();
                    format!(
                        "🟢 Started: {} {} | lev {}x | margin {}%",
                        config.symbol,
                        config.interval,
                        config.leverage,
                        pct(config.margin_use_ratio)
                    )
                }
                Err(EngineError::InsufficientBalance(available)) => {
                    format!("❌ Not started: available balance is {}", available)
                }
                Err(e) => format!("❌ Not started: {}", e),
            },
            "/stopbot" => {
                self.engine.stop();
                "🛑 Bot stopped.".to_string()
            }
            "/stopsession" => match self.engine.stop_session().await {
                Ok(report) => match report.closed {
                    Some((side, qty)) => format!(
                        "✅ Closed {} {}, cancelled {} protective orders.",
                        side, qty, report.cancelled_orders
                    ),
                    None => format!(
                        "✅ No open position, cancelled {} protective orders.",
                        report.cancelled_orders
                    ),
                },
                Err(e) => format!("❌ Session stop failed: {}", e),
            },
            "/status" => self.status_text().await,
            "/stats" => {
                let stats = self.engine.stats();
                format!(
                    "📊 Trades: {} | Wins: {} | Losses: {} | Win rate: {}%",
                    stats.trades_total,
                    stats.wins,
                    stats.losses,
                    stats.win_rate.round_dp(2)
                )
            }
            "/balance" => self.balance_text().await,
            "/settings" => self.settings_text(),
            _ if text.starts_with("/set") => {
                "⚠️ Settings are fixed at startup; change them in the environment.".to_string()
            }
            _ => "❓ Unknown command. /start".to_string(),
        }
    }

    async fn status_text(&self) -> String {
        self.wallet.refresh(false).await;
        let wallet = self.wallet.snapshot();
        let status = self.engine.status();
        let config = self.engine.config();

        let side = status
            .side
            .map(|s| s.to_string())
            .unwrap_or_else(|| "None".to_string());
        let opened_at = status
            .opened_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "-".to_string());
        let planned_tp = status
            .planned_take_profit
            .map(|tp| tp.to_string())
            .unwrap_or_else(|| "-".to_string());

        format!(
            "State: {}\n\
             Symbol: {} | Leverage: {}x | TF: {}\n\
             Wallet: {} | Available: {}\n\
             Session: {} | Opened: {}\n\
             Planned TP: {}\n\
             🏆 Win rate: {}%",
            if status.running { "🟢 RUNNING" } else { "🛑 STOPPED" },
            status.symbol,
            config.leverage,
            config.interval,
            fmt2(wallet.last_wallet_balance),
            fmt2(wallet.last_available_balance),
            side,
            opened_at,
            planned_tp,
            self.engine.stats().win_rate.round_dp(2)
        )
    }

    async fn balance_text(&self) -> String {
        self.wallet.refresh(true).await;
        let wallet = self.wallet.snapshot();
        let (delta, delta_pct) = wallet
            .session_pnl()
            .unwrap_or((Decimal::ZERO, Decimal::ZERO));

        format!(
            "💼 Wallet: {} {asset}\n\
             🧮 Available: {} {asset}\n\
             📈 Session PnL: {} {asset} ({}%)\n\
             🏆 Win rate: {}%",
            fmt2(wallet.last_wallet_balance),
            fmt2(wallet.last_available_balance),
            delta.round_dp(2),
            delta_pct,
            self.engine.stats().win_rate.round_dp(2),
            asset = self.wallet.asset()
        )
    }

    fn settings_text(&self) -> String {
        let config = self.engine.config();
        format!(
            "🔧 Active settings\n\
             - Symbol: {}  TF: {}\n\
             - EMA: {}/{}\n\
             - TP: {}%  SL: {}%\n\
             - Leverage: {}x\n\
             - Position margin: {}% of available {}\n\n\
             Re-entry: disabled (one entry per crossover)",
            config.symbol,
            config.interval,
            config.ema_fast,
            config.ema_slow,
            pct(config.take_profit_pct),
            pct(config.stop_loss_pct),
            config.leverage,
            pct(config.margin_use_ratio),
            config.margin_asset
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::stub::StubExchange;
    use crate::config::BotConfig;
    use rust_decimal_macros::dec;

    fn handler(stub: &Arc<StubExchange>) -> CommandHandler {
        let engine = Arc::new(TradingEngine::new(stub.clone(), BotConfig::default()));
        CommandHandler::new(engine)
    }

    #[tokio::test]
    async fn test_unknown_and_locked_commands() {
        let stub = Arc::new(StubExchange::new("BTCUSDT"));
        let handler = handler(&stub);

        assert!(handler.handle("/nope").await.contains("Unknown command"));
        assert!(handler.handle("/setleverage 50").await.contains("fixed"));
        assert!(handler.handle("  /START ").await.contains("/startbot"));
    }

    #[tokio::test]
    async fn test_startbot_reports_insufficient_balance() {
        let stub = Arc::new(StubExchange::new("BTCUSDT"));
        stub.set_balance(dec!(0), dec!(0));
        let handler = handler(&stub);

        let reply = handler.handle("/startbot").await;
        assert!(reply.contains("Not started"));
        assert!(!handler.engine.is_running());
    }

    #[tokio::test]
    async fn test_settings_show_percentages() {
        let stub = Arc::new(StubExchange::new("BTCUSDT"));
        let reply = handler(&stub).handle("/settings").await;

        assert!(reply.contains("EMA: 1/24"));
        assert!(reply.contains("TP: 0.5%"));
        assert!(reply.contains("SL: 0.1%"));
        assert!(reply.contains("92% of available USDT"));
    }

    #[tokio::test]
    async fn test_balance_and_status() {
        let stub = Arc::new(StubExchange::new("BTCUSDT"));
        stub.set_balance(dec!(1000), dec!(800));
        let handler = handler(&stub);

        let balance = handler.handle("/balance").await;
        assert!(balance.contains("Wallet: 1000"));
        assert!(balance.contains("Available: 800"));

        let status = handler.handle("/status").await;
        assert!(status.contains("STOPPED"));
        assert!(status.contains("Session: None"));
    }

    #[tokio::test]
    async fn test_stopsession_when_flat() {
        let stub = Arc::new(StubExchange::new("BTCUSDT"));
        let reply = handler(&stub).handle("/stopsession").await;
        assert!(reply.contains("No open position"));
    }
}
