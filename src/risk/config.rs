//! Risk limit configuration.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Per-user risk limits. Percentages are fractions of balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Maximum concurrently open positions
    pub max_open_positions: usize,

    /// Maximum confirmed entries per day (exits do not count)
    pub max_daily_trades: u32,

    /// Smallest position as a share of balance
    pub min_position_pct: Decimal,

    /// Largest position as a share of balance
    pub max_position_pct: Decimal,

    /// Net daily loss limit in quote currency
    pub max_daily_loss_usd: Decimal,

    /// Net daily loss limit relative to the day's starting balance
    pub max_daily_loss_pct: Decimal,

    /// Net weekly loss limit relative to the week's starting balance
    pub max_weekly_loss_pct: Decimal,

    /// Maximum drawdown from peak balance
    pub max_drawdown_pct: Decimal,

    /// Gross daily losses that trip the circuit breaker
    pub circuit_breaker_loss_pct: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_open_positions: 5,
            max_daily_trades: 20,
            min_position_pct: dec!(0.005),        // 0.5% of balance
            max_position_pct: dec!(0.20),         // 20% of balance
            max_daily_loss_usd: dec!(500),
            max_daily_loss_pct: dec!(0.05),       // 5%
            max_weekly_loss_pct: dec!(0.10),      // 10%
            max_drawdown_pct: dec!(0.15),         // 15%
            circuit_breaker_loss_pct: dec!(0.03), // 3%
        }
    }
}
