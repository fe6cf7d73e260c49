//! Data models for candles, orders, positions, trades, metrics and allocation.

mod allocation;
mod candle;
mod metrics;
mod order;
mod position;
mod trade;

pub use allocation::{
    AllocationMethod, AllocationPlan, AllocationTarget, RebalanceAction, RebalanceDirection,
    TargetId, TargetType, RETURN_HISTORY_LEN,
};
pub use candle::Candle;
pub use metrics::PerformanceMetrics;
pub use order::{Fill, OrderResponse, OrderSide};
pub use position::{Position, CLOSED_THRESHOLD};
pub use trade::{TradeKind, TradeRecord};
