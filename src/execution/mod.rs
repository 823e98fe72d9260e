// Order execution, position tracking and the trading loop
pub mod engine;
pub mod position_manager;
pub mod protection;
pub mod wallet;

pub use engine::{
    compute_order_qty, EngineError, EngineStatus, EntryAttempt, OpenedPosition, SessionStopReport,
    StatsSnapshot, TickOutcome, TickReport, TradingEngine,
};
pub use position_manager::{
    attribute_outcome, PositionStateMachine, PositionTransition, OUTCOME_LOOKBACK,
};
pub use protection::{
    compute_safe_stop, plan_targets, OrderProtectionPlanner, PlacementReport, ProtectivePlan,
    Reconciliation,
};
pub use wallet::{WalletService, WalletSnapshot};
