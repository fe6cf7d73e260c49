//! Execution safety gate: kill switch, order confirmation, slippage guard,
//! position tracking and stepped profit-taking.

mod engine;
mod error;
mod fill;
mod kill_switch;
mod profit_taking;

pub use engine::{unfavorable_slippage, ExecutionConfig, ExecutionEngine, ExitReport};
pub use error::ExecutionError;
pub use fill::{confirm_order, fill_price, ConfirmedFill, ACCEPTED_STATUSES};
pub use kill_switch::KillSwitch;
pub use profit_taking::{LadderHit, ProfitLadder, ProfitLevel};
