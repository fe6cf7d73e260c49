//! Per-user risk limits and circuit breaker.

mod config;
mod manager;
mod state;

pub use config::RiskConfig;
pub use manager::{TradeDecision, UserRiskManager};
pub use state::UserRiskState;
