use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;

use crate::api::{Exchange, ExchangeError};
use crate::config::BotConfig;
use crate::filters::{round_to_step, SymbolFilterCache};
use crate::models::{OrderRequest, OrderType, SessionState, Side};

/// 0.03% of mark: minimum trigger distance on top of two ticks
pub const DEFAULT_MARK_BUFFER: Decimal = Decimal::from_parts(3, 0, 0, false, 4);

/// Move `target` at least `max(2*tick, mark*buffer)` away from `mark` on the
/// required side, then snap it to the tick grid.
///
/// Trigger orders too close to (or on the wrong side of) the mark price are
/// rejected or fire immediately.
pub fn compute_safe_stop(
    target: Decimal,
    mark: Decimal,
    must_be_above: bool,
    tick: Decimal,
    buffer: Decimal,
) -> Decimal {
    let min_gap = (tick * Decimal::TWO).max(mark * buffer);
    let mut safe = target;

    if must_be_above {
        if safe <= mark + min_gap {
            safe = mark + min_gap;
        }
    } else if safe >= mark - min_gap {
        safe = mark - min_gap;
    }

    round_to_step(safe, tick)
}

/// Take-profit and stop-loss trigger prices for one position
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProtectivePlan {
    pub take_profit: Decimal,
    pub stop_loss: Decimal,
}

/// Raw targets from `reference`, then clamped against `mark`
pub fn plan_targets(
    side: Side,
    reference: Decimal,
    mark: Decimal,
    tick: Decimal,
    take_profit_pct: Decimal,
    stop_loss_pct: Decimal,
    buffer: Decimal,
) -> ProtectivePlan {
    let up = |pct: Decimal| reference * (Decimal::ONE + pct);
    let down = |pct: Decimal| reference * (Decimal::ONE - pct);

    match side {
        Side::Long => ProtectivePlan {
            take_profit: compute_safe_stop(up(take_profit_pct), mark, true, tick, buffer),
            stop_loss: compute_safe_stop(down(stop_loss_pct), mark, false, tick, buffer),
        },
        Side::Short => ProtectivePlan {
            take_profit: compute_safe_stop(down(take_profit_pct), mark, false, tick, buffer),
            stop_loss: compute_safe_stop(up(stop_loss_pct), mark, true, tick, buffer),
        },
    }
}

/// Which protective legs to submit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Legs {
    pub take_profit: bool,
    pub stop_loss: bool,
}

impl Legs {
    pub const BOTH: Legs = Legs {
        take_profit: true,
        stop_loss: true,
    };
}

/// Outcome of a protective placement; each leg succeeds or fails on its own
#[derive(Debug, Clone, PartialEq)]
pub struct PlacementReport {
    pub plan: ProtectivePlan,
    pub take_profit: Option<Result<i64, ExchangeError>>,
    pub stop_loss: Option<Result<i64, ExchangeError>>,
}

impl PlacementReport {
    pub fn fully_placed(&self) -> bool {
        let ok = |leg: &Option<Result<i64, ExchangeError>>| matches!(leg, None | Some(Ok(_)));
        ok(&self.take_profit) && ok(&self.stop_loss)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    /// No live position
    Flat,
    /// Both reduce-only legs already rest on the book
    Protected,
    Repaired(PlacementReport),
}

/// Places and repairs reduce-only take-profit / stop-loss orders
pub struct OrderProtectionPlanner {
    exchange: Arc<dyn Exchange>,
    filters: Arc<SymbolFilterCache>,
    symbol: String,
    take_profit_pct: Decimal,
    stop_loss_pct: Decimal,
    mark_buffer: Decimal,
}

impl OrderProtectionPlanner {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        filters: Arc<SymbolFilterCache>,
        config: &BotConfig,
    ) -> Self {
        Self {
            exchange,
            filters,
            symbol: config.symbol.clone(),
            take_profit_pct: config.take_profit_pct,
            stop_loss_pct: config.stop_loss_pct,
            mark_buffer: config.mark_buffer_pct,
        }
    }

    /// Place both protective legs for a fresh position
    pub async fn place_protective_orders(
        &self,
        side: Side,
        qty: Decimal,
        reference: Decimal,
    ) -> PlacementReport {
        self.place_legs(side, qty, reference, Legs::BOTH).await
    }

    /// Compute the plan against the current mark and submit the requested legs.
    ///
    /// The mark is read before submission; it can move in between.
    pub async fn place_legs(
        &self,
        side: Side,
        qty: Decimal,
        reference: Decimal,
        legs: Legs,
    ) -> PlacementReport {
        let mark = match self.exchange.mark_price(&self.symbol).await {
            Ok(Some(mark)) => mark,
            Ok(None) => reference,
            Err(e) => {
                tracing::warn!(
                    "Mark price unavailable ({}), planning from reference {}",
                    e,
                    reference
                );
                reference
            }
        };
        let tick = self.filters.snapshot().price_tick;

        let plan = plan_targets(
            side,
            reference,
            mark,
            tick,
            self.take_profit_pct,
            self.stop_loss_pct,
            self.mark_buffer,
        );

        let close_side = side.closing_order_side();

        let take_profit = if legs.take_profit {
            let request = OrderRequest::protective(
                &self.symbol,
                close_side,
                OrderType::TakeProfitMarket,
                qty,
                plan.take_profit,
            );
            let result = self.exchange.place_order(&request).await;
            match &result {
                Ok(id) => tracing::info!("🎯 TP set @ {} (order {})", plan.take_profit, id),
                Err(e) => {
                    tracing::warn!("⚠️  TP placement failed @ {}: {}", plan.take_profit, e)
                }
            }
            Some(result)
        } else {
            None
        };

        let stop_loss = if legs.stop_loss {
            let request = OrderRequest::protective(
                &self.symbol,
                close_side,
                OrderType::StopMarket,
                qty,
                plan.stop_loss,
            );
            let result = self.exchange.place_order(&request).await;
            match &result {
                Ok(id) => tracing::info!("🛡️  SL set @ {} (order {})", plan.stop_loss, id),
                Err(e) => tracing::warn!("⚠️  SL placement failed @ {}: {}", plan.stop_loss, e),
            }
            Some(result)
        } else {
            None
        };

        PlacementReport {
            plan,
            take_profit,
            stop_loss,
        }
    }

    /// Re-establish whichever protective leg is missing on a live position.
    ///
    /// Side comes from the sign of the live quantity, not from the session,
    /// so protection heals after restarts and manual intervention.
    pub async fn reconcile_protective_orders(
        &self,
        current_price: Decimal,
        session: &SessionState,
    ) -> Result<Reconciliation, ExchangeError> {
        let qty = self.exchange.position_quantity(&self.symbol).await?;
        let Some(side) = Side::from_quantity(qty) else {
            return Ok(Reconciliation::Flat);
        };

        let open = self.exchange.open_orders(&self.symbol).await?;
        let has_take_profit = open
            .iter()
            .any(|o| o.reduce_only && o.order_type == OrderType::TakeProfitMarket);
        let has_stop_loss = open
            .iter()
            .any(|o| o.reduce_only && o.order_type == OrderType::StopMarket);

        if has_take_profit && has_stop_loss {
            return Ok(Reconciliation::Protected);
        }

        let reference = session.entry_price.unwrap_or(current_price);
        tracing::info!(
            "🔧 Repairing protection for {} {} (tp present: {}, sl present: {})",
            side,
            qty.abs(),
            has_take_profit,
            has_stop_loss
        );

        let legs = Legs {
            take_profit: !has_take_profit,
            stop_loss: !has_stop_loss,
        };
        let report = self.place_legs(side, qty.abs(), reference, legs).await;
        Ok(Reconciliation::Repaired(report))
    }

    /// Cancel every open reduce-only order; individual failures are logged
    pub async fn cancel_reduce_only_orders(&self) -> Result<usize, ExchangeError> {
        let open = self.exchange.open_orders(&self.symbol).await?;
        let mut cancelled = 0;

        for order in open.iter().filter(|o| o.reduce_only) {
            match self.exchange.cancel_order(&self.symbol, order.id).await {
                Ok(()) => cancelled += 1,
                Err(e) => tracing::warn!("Failed to cancel reduce-only order {}: {}", order.id, e),
            }
        }

        Ok(cancelled)
    }

    /// Clear stray reduce-only orders left behind by a closed position
    pub async fn cancel_reduce_only_if_flat(&self) -> Result<usize, ExchangeError> {
        let qty = self.exchange.position_quantity(&self.symbol).await?;
        if !qty.is_zero() {
            return Ok(0);
        }

        let cancelled = self.cancel_reduce_only_orders().await?;
        if cancelled > 0 {
            tracing::info!("🧹 Cancelled {} stray reduce-only orders", cancelled);
        }
        Ok(cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::stub::StubExchange;
    use crate::models::SymbolFilters;
    use rust_decimal_macros::dec;

    fn planner(stub: &Arc<StubExchange>) -> OrderProtectionPlanner {
        let filters = Arc::new(SymbolFilterCache::new(SymbolFilters {
            price_tick: dec!(0.1),
            qty_step: dec!(0.001),
            min_notional: dec!(5),
        }));
        let exchange: Arc<dyn Exchange> = stub.clone();
        OrderProtectionPlanner::new(exchange, filters, &BotConfig::default())
    }

    #[test]
    fn test_safe_stop_clamps_above_mark() {
        // min_gap = max(0.2, 0.03) = 0.2
        let safe = compute_safe_stop(dec!(100.02), dec!(100), true, dec!(0.1), DEFAULT_MARK_BUFFER);
        assert_eq!(safe, dec!(100.2));
    }

    #[test]
    fn test_safe_stop_clamps_below_mark() {
        let safe = compute_safe_stop(dec!(99.99), dec!(100), false, dec!(0.1), DEFAULT_MARK_BUFFER);
        assert_eq!(safe, dec!(99.8));
    }

    #[test]
    fn test_safe_stop_keeps_distant_target() {
        let safe = compute_safe_stop(dec!(100.53), dec!(100), true, dec!(0.1), DEFAULT_MARK_BUFFER);
        assert_eq!(safe, dec!(100.5));
    }

    #[test]
    fn test_safe_stop_percentage_gap_dominates() {
        // mark * buffer = 30 > 2 ticks
        let safe =
            compute_safe_stop(dec!(100010), dec!(100000), true, dec!(0.1), DEFAULT_MARK_BUFFER);
        assert_eq!(safe, dec!(100030));
    }

    #[test]
    fn test_plan_targets_long_and_short() {
        let long = plan_targets(
            Side::Long,
            dec!(100),
            dec!(100),
            dec!(0.01),
            dec!(0.005),
            dec!(0.001),
            DEFAULT_MARK_BUFFER,
        );
        assert_eq!(long.take_profit, dec!(100.5));
        // gap is 0.03, 99.9 already clears it
        assert_eq!(long.stop_loss, dec!(99.9));

        let short = plan_targets(
            Side::Short,
            dec!(100),
            dec!(100),
            dec!(0.01),
            dec!(0.005),
            dec!(0.001),
            DEFAULT_MARK_BUFFER,
        );
        assert_eq!(short.take_profit, dec!(99.5));
        assert_eq!(short.stop_loss, dec!(100.1));
    }

    #[test]
    fn test_plan_respects_direction_when_mark_moved() {
        // mark already ran past the long stop target
        let plan = plan_targets(
            Side::Long,
            dec!(100),
            dec!(99.5),
            dec!(0.1),
            dec!(0.005),
            dec!(0.001),
            DEFAULT_MARK_BUFFER,
        );
        assert!(plan.stop_loss < dec!(99.5));
        assert!(plan.take_profit > dec!(99.5));
    }

    #[tokio::test]
    async fn test_places_reduce_only_legs_on_closing_side() {
        let stub = Arc::new(StubExchange::new("BTCUSDT"));
        stub.set_mark_price(Some(dec!(100)));

        let report = planner(&stub)
            .place_protective_orders(Side::Long, dec!(0.5), dec!(100))
            .await;

        assert!(report.fully_placed());
        let placed = stub.placed_orders();
        assert_eq!(placed.len(), 2);
        assert_eq!(placed[0].order_type, OrderType::TakeProfitMarket);
        assert_eq!(placed[1].order_type, OrderType::StopMarket);
        assert!(placed.iter().all(|o| o.reduce_only && o.quantity == dec!(0.5)));
        assert!(placed
            .iter()
            .all(|o| o.side == crate::models::OrderSide::Sell));
        assert_eq!(placed[0].stop_price, Some(dec!(100.5)));
        assert_eq!(placed[1].stop_price, Some(dec!(99.8)));
    }

    #[tokio::test]
    async fn test_failed_leg_does_not_block_other() {
        let stub = Arc::new(StubExchange::new("BTCUSDT"));
        stub.set_mark_price(Some(dec!(100)));
        stub.reject_order_type(OrderType::TakeProfitMarket);

        let report = planner(&stub)
            .place_protective_orders(Side::Short, dec!(1), dec!(100))
            .await;

        assert!(!report.fully_placed());
        assert!(matches!(report.take_profit, Some(Err(_))));
        assert!(matches!(report.stop_loss, Some(Ok(_))));
        assert_eq!(stub.current_open_orders().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_mark_falls_back_to_reference() {
        let stub = Arc::new(StubExchange::new("BTCUSDT"));
        stub.set_mark_price(None);

        let report = planner(&stub)
            .place_protective_orders(Side::Long, dec!(1), dec!(200))
            .await;

        assert_eq!(report.plan.take_profit, dec!(201));
        assert_eq!(report.plan.stop_loss, dec!(199.8));
    }

    #[tokio::test]
    async fn test_reconcile_flat_is_noop() {
        let stub = Arc::new(StubExchange::new("BTCUSDT"));
        let result = planner(&stub)
            .reconcile_protective_orders(dec!(100), &SessionState::default())
            .await
            .unwrap();

        assert_eq!(result, Reconciliation::Flat);
        assert!(stub.placed_orders().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_fully_protected_is_noop() {
        let stub = Arc::new(StubExchange::new("BTCUSDT"));
        stub.set_position(dec!(1));
        stub.add_open_order(OrderType::TakeProfitMarket, true);
        stub.add_open_order(OrderType::StopMarket, true);

        let result = planner(&stub)
            .reconcile_protective_orders(dec!(100), &SessionState::default())
            .await
            .unwrap();

        assert_eq!(result, Reconciliation::Protected);
        assert!(stub.placed_orders().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_repairs_missing_leg_from_live_side() {
        let stub = Arc::new(StubExchange::new("BTCUSDT"));
        stub.set_mark_price(Some(dec!(100)));
        stub.set_position(dec!(-2));
        stub.add_open_order(OrderType::TakeProfitMarket, true);

        // session is stale (thinks flat), the live short must still be protected
        let result = planner(&stub)
            .reconcile_protective_orders(dec!(100), &SessionState::default())
            .await
            .unwrap();

        let Reconciliation::Repaired(report) = result else {
            panic!("expected repair");
        };
        assert!(report.take_profit.is_none());
        assert!(matches!(report.stop_loss, Some(Ok(_))));

        let placed = stub.placed_orders();
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].order_type, OrderType::StopMarket);
        assert_eq!(placed[0].side, crate::models::OrderSide::Buy);
        assert_eq!(placed[0].quantity, dec!(2));
    }

    #[tokio::test]
    async fn test_reconcile_uses_entry_price_as_reference() {
        let stub = Arc::new(StubExchange::new("BTCUSDT"));
        stub.set_mark_price(Some(dec!(101)));
        stub.set_position(dec!(1));

        let session = SessionState {
            side: Some(Side::Long),
            entry_price: Some(dec!(100)),
            entry_qty: Some(dec!(1)),
            ..SessionState::default()
        };

        let result = planner(&stub)
            .reconcile_protective_orders(dec!(101), &session)
            .await
            .unwrap();

        let Reconciliation::Repaired(report) = result else {
            panic!("expected repair");
        };
        // 100 * 1.005 = 100.5 is under mark + gap, clamp to 101.2
        assert_eq!(report.plan.take_profit, dec!(101.2));
        assert_eq!(report.plan.stop_loss, dec!(99.9));
    }

    #[tokio::test]
    async fn test_cancel_reduce_only_if_flat() {
        let stub = Arc::new(StubExchange::new("BTCUSDT"));
        let tp = stub.add_open_order(OrderType::TakeProfitMarket, true);
        let limit = stub.add_open_order(OrderType::Limit, false);

        let cancelled = planner(&stub).cancel_reduce_only_if_flat().await.unwrap();

        assert_eq!(cancelled, 1);
        assert_eq!(stub.cancelled_orders(), vec![tp]);
        assert_eq!(stub.current_open_orders()[0].id, limit);
    }

    #[tokio::test]
    async fn test_cancel_skipped_while_position_open() {
        let stub = Arc::new(StubExchange::new("BTCUSDT"));
        stub.set_position(dec!(1));
        stub.add_open_order(OrderType::StopMarket, true);

        let cancelled = planner(&stub).cancel_reduce_only_if_flat().await.unwrap();
        assert_eq!(cancelled, 0);
        assert!(stub.cancelled_orders().is_empty());
    }
}
