//! Allocation targets and the plans computed over them.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::PerformanceMetrics;

/// Rolling return window kept per target.
pub const RETURN_HISTORY_LEN: usize = 100;

/// Identifier of an allocation target (strategy name, broker name, asset symbol).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(pub String);

impl TargetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TargetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What kind of thing capital is allocated to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Strategy,
    Broker,
    Asset,
}

/// Weighting scheme used to build a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationMethod {
    /// Capital / N
    EqualWeight,
    /// Weight proportional to max(0.1, Sharpe)
    SharpeWeighted,
    /// Weight proportional to 1 / volatility
    RiskParity,
    /// Weight = clamp(Sharpe / 10, 0.01, 0.25)
    Kelly,
}

impl AllocationMethod {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "equal" | "equal_weight" => Some(Self::EqualWeight),
            "sharpe" | "sharpe_weighted" => Some(Self::SharpeWeighted),
            "risk_parity" | "riskparity" => Some(Self::RiskParity),
            "kelly" => Some(Self::Kelly),
            _ => None,
        }
    }
}

/// A strategy, broker or asset competing for capital.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationTarget {
    pub id: TargetId,

    #[serde(rename = "type")]
    pub target_type: TargetType,

    /// Trailing performance metrics
    #[serde(default)]
    pub metrics: PerformanceMetrics,

    /// Capital currently deployed to this target
    #[serde(default)]
    pub current_capital: Decimal,

    /// Last planned share of total capital
    #[serde(default)]
    pub target_allocation_pct: f64,

    /// Lower bound on the weight (0.0 to 1.0)
    #[serde(default = "default_min_pct")]
    pub min_allocation_pct: f64,

    /// Upper bound on the weight (0.0 to 1.0)
    #[serde(default = "default_max_pct")]
    pub max_allocation_pct: f64,

    #[serde(default = "default_active")]
    pub active: bool,

    /// Most recent per-period returns, oldest first
    #[serde(default)]
    pub returns_history: VecDeque<f64>,
}

fn default_min_pct() -> f64 {
    0.05
}

fn default_max_pct() -> f64 {
    0.40
}

fn default_active() -> bool {
    true
}

impl AllocationTarget {
    pub fn new(id: impl Into<String>, target_type: TargetType) -> Self {
        Self {
            id: TargetId::new(id),
            target_type,
            metrics: PerformanceMetrics::new(),
            current_capital: Decimal::ZERO,
            target_allocation_pct: 0.0,
            min_allocation_pct: default_min_pct(),
            max_allocation_pct: default_max_pct(),
            active: true,
            returns_history: VecDeque::with_capacity(RETURN_HISTORY_LEN),
        }
    }

    /// Append returns, keeping only the last `RETURN_HISTORY_LEN`.
    pub fn push_returns(&mut self, returns: &[f64]) {
        for r in returns {
            if self.returns_history.len() == RETURN_HISTORY_LEN {
                self.returns_history.pop_front();
            }
            self.returns_history.push_back(*r);
        }
    }

    /// Trailing window padded at the front with zeros to exactly
    /// `RETURN_HISTORY_LEN` entries.
    pub fn padded_returns(&self) -> Vec<f64> {
        let len = self.returns_history.len();
        let mut padded = vec![0.0; RETURN_HISTORY_LEN.saturating_sub(len)];
        padded.extend(
            self.returns_history
                .iter()
                .skip(len.saturating_sub(RETURN_HISTORY_LEN))
                .copied(),
        );
        padded
    }
}

/// Direction of a rebalancing move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebalanceDirection {
    Increase,
    Decrease,
}

/// A capital move needed to go from the previous plan to a new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceAction {
    pub target_id: TargetId,
    pub from_capital: Decimal,
    pub to_capital: Decimal,
    pub delta: Decimal,
    pub direction: RebalanceDirection,
}

/// Immutable snapshot of a computed allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationPlan {
    pub created_at: DateTime<Utc>,
    pub method: AllocationMethod,
    pub total_capital: Decimal,
    pub reserve_capital: Decimal,

    /// Capital per target
    pub allocations: HashMap<TargetId, Decimal>,

    /// Share of total capital per target
    pub allocation_pcts: HashMap<TargetId, f64>,

    pub expected_return: f64,
    pub expected_volatility: f64,
    pub expected_sharpe: f64,

    /// 0.0 (concentrated, correlated) to 1.0 (spread, uncorrelated)
    pub diversification_score: f64,

    /// Moves versus the previous plan
    pub rebalancing_actions: Vec<RebalanceAction>,
}

impl AllocationPlan {
    /// Total capital allocated (excludes the reserve and anything left unused).
    pub fn allocated_capital(&self) -> Decimal {
        self.allocations.values().copied().sum()
    }

    pub fn total_pct(&self) -> f64 {
        self.allocation_pcts.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_returns_history_is_bounded() {
        let mut target = AllocationTarget::new("momentum", TargetType::Strategy);
        let returns: Vec<f64> = (0..150).map(|i| i as f64 / 1000.0).collect();
        target.push_returns(&returns);

        assert_eq!(target.returns_history.len(), RETURN_HISTORY_LEN);
        assert_eq!(target.returns_history.front().copied(), Some(0.05));
    }

    #[test]
    fn test_padded_returns_front_fills_zeros() {
        let mut target = AllocationTarget::new("kraken", TargetType::Broker);
        target.push_returns(&[0.01, -0.02]);

        let padded = target.padded_returns();
        assert_eq!(padded.len(), RETURN_HISTORY_LEN);
        assert_eq!(padded[0], 0.0);
        assert_eq!(padded[98], 0.01);
        assert_eq!(padded[99], -0.02);
    }

    #[test]
    fn test_padded_returns_keeps_latest_window_of_overlong_history() {
        let mut target = AllocationTarget::new("kraken", TargetType::Broker);
        target.returns_history = (0..150).map(|i| i as f64).collect();

        let padded = target.padded_returns();
        assert_eq!(padded.len(), RETURN_HISTORY_LEN);
        assert_eq!(padded[0], 50.0);
        assert_eq!(padded[99], 149.0);
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!(AllocationMethod::from_str("sharpe"), Some(AllocationMethod::SharpeWeighted));
        assert_eq!(AllocationMethod::from_str("RISK_PARITY"), Some(AllocationMethod::RiskParity));
        assert_eq!(AllocationMethod::from_str("magic"), None);
    }
}
