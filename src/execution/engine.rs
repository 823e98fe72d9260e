//! Trading loop for one symbol.
//!
//! A single background task owns all mutation of the session and stats;
//! the command surface only reads snapshots or flips the running flag.

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::api::{Exchange, ExchangeError, PositionModeProbe};
use crate::config::BotConfig;
use crate::execution::position_manager::{
    attribute_outcome, PositionStateMachine, PositionTransition,
};
use crate::execution::protection::{OrderProtectionPlanner, PlacementReport, Reconciliation};
use crate::execution::wallet::WalletService;
use crate::filters::{round_down_to_step, SymbolFilterCache};
use crate::models::{OrderRequest, Side, SymbolFilters, TradeOutcome};
use crate::strategy::{CrossSignal, Detection, EmaCrossStrategy, Strategy};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Insufficient available balance: {0}")]
    InsufficientBalance(Decimal),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

/// Read-only view of the engine for status queries
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EngineStatus {
    pub running: bool,
    pub symbol: String,
    pub side: Option<Side>,
    pub entry_price: Option<Decimal>,
    pub entry_qty: Option<Decimal>,
    pub opened_at: Option<DateTime<Utc>>,
    pub planned_take_profit: Option<Decimal>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct StatsSnapshot {
    pub trades_total: u32,
    pub wins: u32,
    pub losses: u32,
    /// Percent, 0 when no trades
    pub win_rate: Decimal,
}

/// A position opened by the bot
#[derive(Debug, Clone, PartialEq)]
pub struct OpenedPosition {
    pub side: Side,
    pub qty: Decimal,
    pub entry_price: Decimal,
    pub order_id: i64,
    pub protection: PlacementReport,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryAttempt {
    Opened(OpenedPosition),
    Failed { side: Side, reason: String },
}

/// What one evaluated tick observed and did
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub candle_close_time: DateTime<Utc>,
    pub last_close: Decimal,
    pub signal: CrossSignal,
    pub position_qty: Decimal,
    /// None when the position could not be read
    pub transition: Option<PositionTransition>,
    pub closed_outcome: Option<TradeOutcome>,
    pub reconciliation: Option<Reconciliation>,
    pub entry: Option<EntryAttempt>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    NoCandles,
    WarmingUp { have: usize, need: usize },
    Evaluated(TickReport),
}

/// Result of a manual session stop
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionStopReport {
    /// Side and size of the position that was market-closed
    pub closed: Option<(Side, Decimal)>,
    pub cancelled_orders: usize,
}

/// Size an entry from available margin.
///
/// `notional = max(available * margin_use_ratio * leverage, min_notional)`,
/// rounded down to the quantity step.
pub fn compute_order_qty(
    price: Decimal,
    available: Decimal,
    filters: &SymbolFilters,
    leverage: u32,
    margin_use_ratio: Decimal,
) -> anyhow::Result<Decimal> {
    if price <= Decimal::ZERO {
        anyhow::bail!("Cannot size order at price {}", price);
    }

    let notional =
        (available * margin_use_ratio * Decimal::from(leverage)).max(filters.min_notional);
    let qty = round_down_to_step(notional / price, filters.qty_step);

    if qty <= Decimal::ZERO {
        anyhow::bail!("Order quantity rounds to zero (notional {} @ {})", notional, price);
    }
    if qty * price < filters.min_notional {
        anyhow::bail!(
            "Order notional {} below exchange minimum {}",
            qty * price,
            filters.min_notional
        );
    }

    Ok(qty)
}

pub struct TradingEngine {
    config: BotConfig,
    exchange: Arc<dyn Exchange>,
    strategy: Arc<dyn Strategy>,
    filters: Arc<SymbolFilterCache>,
    protection: OrderProtectionPlanner,
    wallet: Arc<WalletService>,
    machine: RwLock<PositionStateMachine>,
    running: AtomicBool,
    loops_spawned: AtomicUsize,
    cancel: Mutex<CancellationToken>,
    /// Held by the active loop task; a new loop waits for the old one to drain
    loop_lease: tokio::sync::Mutex<()>,
    position_mode: OnceCell<PositionModeProbe>,
}

impl TradingEngine {
    pub fn new(exchange: Arc<dyn Exchange>, config: BotConfig) -> Self {
        let filters = Arc::new(SymbolFilterCache::new(SymbolFilters::default()));
        let protection = OrderProtectionPlanner::new(exchange.clone(), filters.clone(), &config);
        let wallet = Arc::new(WalletService::new(exchange.clone(), &config.margin_asset));
        let strategy: Arc<dyn Strategy> =
            Arc::new(EmaCrossStrategy::new(config.ema_fast, config.ema_slow));

        Self {
            config,
            exchange,
            strategy,
            filters,
            protection,
            wallet,
            machine: RwLock::new(PositionStateMachine::new()),
            running: AtomicBool::new(false),
            loops_spawned: AtomicUsize::new(0),
            cancel: Mutex::new(CancellationToken::new()),
            loop_lease: tokio::sync::Mutex::new(()),
            position_mode: OnceCell::new(),
        }
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn Strategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn config(&self) -> &BotConfig {
        &self.config
    }

    pub fn wallet(&self) -> Arc<WalletService> {
        self.wallet.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Loop tasks spawned over the engine's lifetime
    pub fn loops_spawned(&self) -> usize {
        self.loops_spawned.load(Ordering::Acquire)
    }

    fn machine(&self) -> RwLockReadGuard<'_, PositionStateMachine> {
        self.machine.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn machine_mut(&self) -> RwLockWriteGuard<'_, PositionStateMachine> {
        self.machine.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ============== Control ==============

    /// Verify preconditions and spawn the trading loop.
    ///
    /// Calling this while already running is a no-op; concurrent calls
    /// spawn at most one loop.
    pub async fn start(self: &Arc<Self>) -> Result<(), EngineError> {
        if self.is_running() {
            tracing::info!("Trading loop already running for {}", self.config.symbol);
            return Ok(());
        }

        if let Err(e) = self.protection.cancel_reduce_only_if_flat().await {
            tracing::warn!("Stray order cleanup skipped: {}", e);
        }
        self.wallet.refresh(true).await;
        self.apply_account_settings().await;
        self.filters.refresh(self.exchange.as_ref(), &self.config.symbol).await;

        let available = self.wallet.available();
        if available <= Decimal::ZERO {
            tracing::error!(
                "❌ Cannot start: available {} balance is {}",
                self.wallet.asset(),
                available
            );
            return Err(EngineError::InsufficientBalance(available));
        }

        let token = {
            let mut slot = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
            if self
                .running
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return Ok(());
            }
            let token = CancellationToken::new();
            *slot = token.clone();
            token
        };

        self.loops_spawned.fetch_add(1, Ordering::AcqRel);
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.run_loop(token).await;
        });

        tracing::info!(
            "🚀 Trading started: {} {} EMA {}/{} x{}",
            self.config.symbol,
            self.config.interval,
            self.config.ema_fast,
            self.config.ema_slow,
            self.config.leverage
        );
        Ok(())
    }

    /// Idempotent. The loop exits at its next suspension point.
    pub fn stop(&self) {
        let slot = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        if self.running.swap(false, Ordering::AcqRel) {
            tracing::info!("🛑 Stop requested for {}", self.config.symbol);
        }
        slot.cancel();
    }

    /// Market-close any live position and cancel all reduce-only orders.
    ///
    /// Leaves the running flag alone. The session itself is reset by the
    /// loop when it observes the flat position.
    pub async fn stop_session(&self) -> Result<SessionStopReport, EngineError> {
        let symbol = &self.config.symbol;
        let qty = self.exchange.position_quantity(symbol).await?;

        let closed = match Side::from_quantity(qty) {
            Some(side) => {
                let request =
                    OrderRequest::close_market(symbol, side.closing_order_side(), qty.abs());
                self.exchange.place_order(&request).await?;
                tracing::info!("🔻 Session stop: closed {} {} {}", side, qty.abs(), symbol);
                Some((side, qty.abs()))
            }
            None => None,
        };

        let cancelled_orders = self.protection.cancel_reduce_only_orders().await?;

        Ok(SessionStopReport {
            closed,
            cancelled_orders,
        })
    }

    pub fn status(&self) -> EngineStatus {
        let machine = self.machine();
        let session = machine.session();
        EngineStatus {
            running: self.is_running(),
            symbol: self.config.symbol.clone(),
            side: session.side,
            entry_price: session.entry_price,
            entry_qty: session.entry_qty,
            opened_at: session.opened_at,
            planned_take_profit: session.planned_take_profit,
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        let stats = self.machine().stats();
        StatsSnapshot {
            trades_total: stats.trades_total,
            wins: stats.wins,
            losses: stats.losses,
            win_rate: stats.win_rate(),
        }
    }

    // ============== Loop ==============

    async fn run_loop(self: Arc<Self>, token: CancellationToken) {
        let _lease = tokio::select! {
            lease = self.loop_lease.lock() => lease,
            _ = token.cancelled() => return,
        };

        tracing::info!("▶️  Trading loop running ({})", self.strategy.name());

        while !token.is_cancelled() {
            match self.run_tick().await {
                Ok(outcome) => log_tick(&outcome),
                Err(e) => tracing::error!("Tick failed: {:#}", e),
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.config.tick_interval()) => {}
            }
        }

        tracing::info!("⏹️  Trading loop stopped for {}", self.config.symbol);
    }

    /// One pass of the trading loop. Errors never leave partial session state.
    pub async fn run_tick(&self) -> anyhow::Result<TickOutcome> {
        let symbol = &self.config.symbol;
        let now = Utc::now();

        let candles = self
            .exchange
            .recent_candles(symbol, &self.config.interval, self.config.candle_limit)
            .await
            .context("Failed to fetch candles")?;
        if candles.is_empty() {
            return Ok(TickOutcome::NoCandles);
        }

        let evaluation = match self.strategy.evaluate(&candles, now) {
            Detection::InsufficientData { have, need } => {
                return Ok(TickOutcome::WarmingUp { have, need })
            }
            Detection::Ready(evaluation) => evaluation,
        };

        let (position_qty, transition) = match self.exchange.position_quantity(symbol).await {
            Ok(qty) => {
                let transition = self.machine_mut().observe_position(qty);
                (qty, Some(transition))
            }
            Err(e) => {
                tracing::warn!("Position read failed, skipping transition check: {}", e);
                (Decimal::ZERO, None)
            }
        };

        let closed_outcome = match transition {
            Some(PositionTransition::Closed) => Some(self.handle_close(now).await),
            Some(PositionTransition::Opened) => {
                tracing::info!("📗 Position detected on {}: {}", symbol, position_qty);
                None
            }
            _ => None,
        };

        let reconciliation = if position_qty.is_zero() {
            None
        } else {
            let session = self.machine().session().clone();
            match self
                .protection
                .reconcile_protective_orders(evaluation.last_close, &session)
                .await
            {
                Ok(result) => Some(result),
                Err(e) => {
                    tracing::warn!("Protection check failed: {}", e);
                    None
                }
            }
        };

        let mut entry = None;
        if let Some(side) = evaluation.signal.entry_side() {
            let can_enter = self.machine().can_enter(evaluation.candle_close_time);
            if can_enter {
                if let Err(e) = self.protection.cancel_reduce_only_if_flat().await {
                    tracing::warn!("Pre-entry cleanup failed: {}", e);
                }

                let attempt = match self.try_open(side, evaluation.last_close).await {
                    Ok(opened) => EntryAttempt::Opened(opened),
                    Err(e) => {
                        tracing::warn!("❌ {} entry on {} abandoned: {:#}", side, symbol, e);
                        EntryAttempt::Failed {
                            side,
                            reason: format!("{:#}", e),
                        }
                    }
                };
                self.machine_mut().mark_processed(evaluation.candle_close_time);
                entry = Some(attempt);
            }
        }

        self.wallet.refresh(false).await;

        Ok(TickOutcome::Evaluated(TickReport {
            candle_close_time: evaluation.candle_close_time,
            last_close: evaluation.last_close,
            signal: evaluation.signal,
            position_qty,
            transition,
            closed_outcome,
            reconciliation,
            entry,
        }))
    }

    async fn handle_close(&self, now: DateTime<Utc>) -> TradeOutcome {
        let lookback = Duration::minutes(self.config.outcome_lookback_minutes);
        let window_start = self.machine().outcome_window_start(lookback);

        let outcome = match window_start {
            Some(from) => match self.exchange.order_history(&self.config.symbol, from, now).await {
                Ok(orders) => attribute_outcome(&orders),
                Err(e) => {
                    tracing::warn!("Order history unavailable, outcome unknown: {}", e);
                    TradeOutcome::Unknown
                }
            },
            None => {
                tracing::warn!("Closed position has no entry time, outcome unknown");
                TradeOutcome::Unknown
            }
        };

        let stats = self.machine_mut().apply_close(outcome);
        tracing::info!(
            "📕 Position closed ({}) | trades: {} wins: {} losses: {} win rate: {:.1}%",
            outcome,
            stats.trades_total,
            stats.wins,
            stats.losses,
            stats.win_rate()
        );

        if let Err(e) = self.protection.cancel_reduce_only_if_flat().await {
            tracing::warn!("Post-close cleanup failed: {}", e);
        }

        outcome
    }

    /// Open `side` at market and protect it. On error the session stays flat.
    pub async fn try_open(&self, side: Side, reference: Decimal) -> anyhow::Result<OpenedPosition> {
        let symbol = &self.config.symbol;

        self.apply_account_settings().await;
        self.wallet.refresh(false).await;
        self.filters.refresh(self.exchange.as_ref(), symbol).await;

        let qty = compute_order_qty(
            reference,
            self.wallet.available(),
            &self.filters.snapshot(),
            self.config.leverage,
            self.config.margin_use_ratio,
        )?;

        let request = OrderRequest::market(symbol, side.entry_order_side(), qty);
        let order_id = self
            .exchange
            .place_order(&request)
            .await
            .context("Entry order rejected")?;

        self.machine_mut().record_entry(side, reference, qty, Utc::now())?;
        tracing::info!(
            "🟢 Opened {} {} {} @ ~{}",
            side,
            qty,
            symbol,
            self.filters.format_price(reference)
        );

        let post_entry_mark = match self.exchange.mark_price(symbol).await {
            Ok(Some(mark)) => mark,
            Ok(None) => reference,
            Err(e) => {
                tracing::warn!(
                    "Post-entry mark unavailable ({}), protecting from {}",
                    e,
                    reference
                );
                reference
            }
        };

        let protection = self
            .protection
            .place_protective_orders(side, qty, post_entry_mark)
            .await;
        self.machine_mut().set_planned_take_profit(protection.plan.take_profit);

        Ok(OpenedPosition {
            side,
            qty,
            entry_price: reference,
            order_id,
            protection,
        })
    }

    /// One-way mode (when offered), isolated margin, leverage. Each step is
    /// best-effort.
    pub async fn apply_account_settings(&self) {
        let symbol = &self.config.symbol;

        let mode = *self
            .position_mode
            .get_or_init(|| async {
                match self.exchange.probe_position_mode().await {
                    Ok(mode) => mode,
                    Err(e) => {
                        tracing::debug!("Position mode probe failed: {}", e);
                        PositionModeProbe::Unsupported
                    }
                }
            })
            .await;

        if mode == PositionModeProbe::Hedge {
            if let Err(e) = self.exchange.set_one_way_mode().await {
                tracing::debug!("One-way mode not applied: {}", e);
            }
        }

        if let Err(e) = self.exchange.set_isolated_margin(symbol).await {
            tracing::debug!("Isolated margin not applied: {}", e);
        }
        if let Err(e) = self.exchange.set_leverage(symbol, self.config.leverage).await {
            tracing::debug!("Leverage not applied: {}", e);
        }
    }
}

fn log_tick(outcome: &TickOutcome) {
    match outcome {
        TickOutcome::NoCandles => tracing::debug!("No candles yet"),
        TickOutcome::WarmingUp { have, need } => {
            tracing::debug!("Warming up: {}/{} closed candles", have, need)
        }
        TickOutcome::Evaluated(report) => {
            if report.signal != CrossSignal::None {
                tracing::info!(
                    "📊 {:?} on candle {} (close {})",
                    report.signal,
                    report.candle_close_time,
                    report.last_close
                );
            } else {
                tracing::debug!(
                    "Tick: close {} qty {} on candle {}",
                    report.last_close,
                    report.position_qty,
                    report.candle_close_time
                );
            }
        }
    }
}
