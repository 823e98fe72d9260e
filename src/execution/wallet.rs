use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};

use crate::api::Exchange;

/// Last known balances of the margin asset
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct WalletSnapshot {
    /// First successful wallet read since startup
    pub start_wallet_balance: Option<Decimal>,
    pub last_wallet_balance: Option<Decimal>,
    pub last_available_balance: Option<Decimal>,
}

impl WalletSnapshot {
    /// Wallet change since startup as (delta, percent)
    pub fn session_pnl(&self) -> Option<(Decimal, Decimal)> {
        let start = self.start_wallet_balance?;
        let last = self.last_wallet_balance?;
        let delta = last - start;

        let pct = if start.is_zero() {
            Decimal::ZERO
        } else {
            (delta / start * Decimal::ONE_HUNDRED)
                .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
        };

        Some((delta, pct))
    }
}

/// Caches wallet balances; refresh failures keep the previous values
pub struct WalletService {
    exchange: Arc<dyn Exchange>,
    asset: String,
    snapshot: RwLock<WalletSnapshot>,
}

impl WalletService {
    pub fn new(exchange: Arc<dyn Exchange>, asset: &str) -> Self {
        Self {
            exchange,
            asset: asset.to_string(),
            snapshot: RwLock::new(WalletSnapshot::default()),
        }
    }

    pub fn asset(&self) -> &str {
        &self.asset
    }

    /// Re-read balances. Returns whether the read succeeded.
    pub async fn refresh(&self, verbose: bool) -> bool {
        match self.exchange.wallet_balance(&self.asset).await {
            Ok(balance) => {
                let mut snapshot = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
                if let Some(wallet) = balance.wallet_balance {
                    snapshot.start_wallet_balance.get_or_insert(wallet);
                    snapshot.last_wallet_balance = Some(wallet);
                }
                if let Some(available) = balance.available_balance {
                    snapshot.last_available_balance = Some(available);
                }
                if verbose {
                    tracing::info!(
                        "💰 {} wallet: {:?}, available: {:?}",
                        self.asset,
                        snapshot.last_wallet_balance,
                        snapshot.last_available_balance
                    );
                }
                true
            }
            Err(e) => {
                if verbose {
                    tracing::warn!("Wallet refresh failed: {}", e);
                } else {
                    tracing::debug!("Wallet refresh failed: {}", e);
                }
                false
            }
        }
    }

    pub fn snapshot(&self) -> WalletSnapshot {
        *self.snapshot.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Available balance, zero when never read
    pub fn available(&self) -> Decimal {
        self.snapshot().last_available_balance.unwrap_or(Decimal::ZERO)
    }
}
