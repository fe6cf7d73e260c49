//! Position sizing configuration.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Configuration for sizing new entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SizingConfig {
    /// Which position sizing method to use (fixed, score, kelly)
    pub sizing_method: String,

    /// Base share of balance per position (0.0 to 1.0)
    pub position_pct: Decimal,

    /// Fraction of Kelly to use (0.0 to 1.0, typically 0.25)
    pub kelly_fraction: Decimal,

    /// Minimum trade size in USD
    pub min_trade_size: Decimal,

    /// Maximum trade size in USD
    pub max_trade_size: Decimal,

    /// Maximum share of balance across all open positions
    pub max_portfolio_allocation: Decimal,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            sizing_method: "fixed".to_string(),
            position_pct: dec!(0.05),             // 5% of balance
            kelly_fraction: dec!(0.25),           // Quarter Kelly
            min_trade_size: dec!(10),             // Min $10
            max_trade_size: dec!(1000),           // Max $1000
            max_portfolio_allocation: dec!(0.5),  // Max 50% of balance deployed
        }
    }
}
