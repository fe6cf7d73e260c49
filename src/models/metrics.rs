//! Trailing performance metrics for an allocation target.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Risk-adjusted performance of a strategy, broker or asset.
///
/// Returns are per-period fractions (0.01 = 1%). Sharpe and Sortino are
/// annualized; volatility and average return are per period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    /// When these metrics were calculated
    pub calculated_at: DateTime<Utc>,

    /// Number of return observations used
    pub observations: u32,

    /// Annualized Sharpe ratio (risk-adjusted returns)
    pub sharpe_ratio: f64,

    /// Sortino ratio (downside risk-adjusted returns)
    pub sortino_ratio: f64,

    /// Profit factor (sum of gains / sum of losses)
    pub profit_factor: f64,

    /// Fraction of positive periods (0.0 to 1.0)
    pub win_rate: f64,

    /// Mean per-period return
    pub avg_return: f64,

    /// Standard deviation of per-period returns
    pub volatility: f64,

    /// Maximum drawdown of the compounded equity curve (0.0 to 1.0)
    pub max_drawdown: f64,
}

impl PerformanceMetrics {
    pub fn new() -> Self {
        Self {
            calculated_at: Utc::now(),
            observations: 0,
            sharpe_ratio: 0.0,
            sortino_ratio: 0.0,
            profit_factor: 0.0,
            win_rate: 0.0,
            avg_return: 0.0,
            volatility: 0.0,
            max_drawdown: 0.0,
        }
    }

    /// Whether there is enough history to trust the ratios.
    pub fn is_meaningful(&self, min_observations: u32) -> bool {
        self.observations >= min_observations
    }
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self::new()
    }
}
