// Core modules
pub mod api;
pub mod commands;
pub mod config;
pub mod execution;
pub mod filters;
pub mod indicators;
pub mod models;
pub mod strategy;

// Re-export commonly used types
pub use api::{Exchange, ExchangeError};
pub use config::BotConfig;
pub use execution::{EngineError, TradingEngine};
pub use models::*;
pub use strategy::Strategy;

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
