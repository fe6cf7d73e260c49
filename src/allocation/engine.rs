//! Capital allocation engine: targets, plan construction and history.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::error::{AllocationError, Result};
use super::{allocator, portfolio};
use crate::metrics::{MetricsCalculator, DEFAULT_PERIODS_PER_YEAR};
use crate::models::{
    AllocationMethod, AllocationPlan, AllocationTarget, PerformanceMetrics, RebalanceAction,
    RebalanceDirection, TargetId, TargetType,
};

/// Capital allocation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationConfig {
    /// Capital to split across targets
    pub total_capital: Decimal,
    /// Fraction of total capital held back (0.10 = 10%)
    pub reserve_pct: f64,
    /// Minimum |delta| as a fraction of total capital to emit a rebalance
    pub rebalance_threshold: f64,
    pub default_method: AllocationMethod,
    /// Used to annualize target Sharpe ratios
    pub periods_per_year: f64,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            total_capital: dec!(10000), // $10k
            reserve_pct: 0.10,          // 10% held back
            rebalance_threshold: 0.05,  // 5% of total capital
            default_method: AllocationMethod::SharpeWeighted,
            periods_per_year: DEFAULT_PERIODS_PER_YEAR,
        }
    }
}

/// Splits capital across strategies, brokers and assets.
pub struct CapitalAllocationEngine {
    config: AllocationConfig,
    targets: BTreeMap<TargetId, AllocationTarget>,
    history: Vec<AllocationPlan>,
}

impl CapitalAllocationEngine {
    pub fn new(config: AllocationConfig) -> Self {
        Self {
            config,
            targets: BTreeMap::new(),
            history: Vec::new(),
        }
    }

    pub fn config(&self) -> &AllocationConfig {
        &self.config
    }

    pub fn set_total_capital(&mut self, total: Decimal) {
        self.config.total_capital = total;
    }

    /// Register a target, replacing any existing one with the same id.
    ///
    /// A supplied return history is trimmed to the trailing window.
    pub fn add_target(&mut self, mut target: AllocationTarget) -> Result<()> {
        let (min, max) = (target.min_allocation_pct, target.max_allocation_pct);
        if !(0.0..=1.0).contains(&min) || !(0.0..=1.0).contains(&max) || min > max {
            return Err(AllocationError::InvalidBounds {
                id: target.id.clone(),
                min,
                max,
            });
        }

        let history: Vec<f64> = std::mem::take(&mut target.returns_history).into();
        target.push_returns(&history);

        debug!(target_id = %target.id, kind = ?target.target_type, "Allocation target added");
        self.targets.insert(target.id.clone(), target);
        Ok(())
    }

    pub fn remove_target(&mut self, id: &TargetId) -> Option<AllocationTarget> {
        self.targets.remove(id)
    }

    pub fn set_active(&mut self, id: &TargetId, active: bool) -> Result<()> {
        let target = self.target_mut(id)?;
        target.active = active;
        Ok(())
    }

    pub fn target(&self, id: &TargetId) -> Option<&AllocationTarget> {
        self.targets.get(id)
    }

    pub fn targets(&self) -> impl Iterator<Item = &AllocationTarget> {
        self.targets.values()
    }

    /// Append new per-period returns to a target and recompute its metrics.
    pub fn update_performance(&mut self, id: &TargetId, returns: &[f64]) -> Result<&PerformanceMetrics> {
        let periods = self.config.periods_per_year;
        let target = self.target_mut(id)?;

        target.push_returns(returns);
        let history: Vec<f64> = target.returns_history.iter().copied().collect();
        target.metrics = MetricsCalculator::calculate_with_periods(&history, periods);

        debug!(
            target_id = %id,
            observations = target.metrics.observations,
            sharpe = target.metrics.sharpe_ratio,
            volatility = target.metrics.volatility,
            "Target performance updated"
        );
        Ok(&target.metrics)
    }

    /// Build a new plan over the active targets, optionally of one type.
    ///
    /// The plan is appended to history; it does not move any capital until
    /// passed to [`apply_plan`](Self::apply_plan).
    pub fn create_allocation_plan(
        &mut self,
        method: AllocationMethod,
        filter: Option<TargetType>,
    ) -> Result<AllocationPlan> {
        let selected: Vec<&AllocationTarget> = self
            .targets
            .values()
            .filter(|t| t.active && filter.map_or(true, |f| t.target_type == f))
            .collect();

        if selected.is_empty() {
            return Err(AllocationError::NoActiveTargets);
        }

        let total_capital = self.config.total_capital.max(Decimal::ZERO);
        let reserve_pct = self.config.reserve_pct.clamp(0.0, 1.0);
        let reserve_capital = round_down(total_capital * to_decimal(reserve_pct));
        let available = total_capital - reserve_capital;

        let weights = allocator::weights(method, &selected);

        let mut allocations = HashMap::with_capacity(selected.len());
        let mut allocation_pcts = HashMap::with_capacity(selected.len());
        let mut pcts = Vec::with_capacity(selected.len());

        for (target, weight) in selected.iter().zip(&weights) {
            let capital = round_down(available * to_decimal(*weight));
            let pct = share_of(capital, total_capital);

            allocations.insert(target.id.clone(), capital);
            allocation_pcts.insert(target.id.clone(), pct);
            pcts.push(pct);
        }

        let stats = portfolio::expected_stats(&selected, &pcts, self.config.periods_per_year);
        let diversification_score = portfolio::diversification_score(&selected, &pcts);
        let rebalancing_actions = self.rebalancing_actions(&allocations, filter, total_capital);

        let plan = AllocationPlan {
            created_at: Utc::now(),
            method,
            total_capital,
            reserve_capital,
            allocations,
            allocation_pcts,
            expected_return: stats.expected_return,
            expected_volatility: stats.expected_volatility,
            expected_sharpe: stats.expected_sharpe,
            diversification_score,
            rebalancing_actions,
        };

        for (id, pct) in &plan.allocation_pcts {
            if let Some(target) = self.targets.get_mut(id) {
                target.target_allocation_pct = *pct;
            }
        }

        info!(
            method = ?method,
            targets = plan.allocations.len(),
            allocated = %plan.allocated_capital(),
            reserve = %plan.reserve_capital,
            diversification = format!("{:.2}", plan.diversification_score),
            rebalances = plan.rebalancing_actions.len(),
            "Allocation plan created"
        );

        self.history.push(plan.clone());
        Ok(plan)
    }

    /// Set each planned target's current capital to its allocation.
    pub fn apply_plan(&mut self, plan: &AllocationPlan) -> Result<()> {
        for id in plan.allocations.keys() {
            if !self.targets.contains_key(id) {
                return Err(AllocationError::UnknownTarget(id.clone()));
            }
        }
        for (id, capital) in &plan.allocations {
            if let Some(target) = self.targets.get_mut(id) {
                target.current_capital = *capital;
            }
        }
        info!(targets = plan.allocations.len(), "Allocation plan applied");
        Ok(())
    }

    pub fn current_plan(&self) -> Option<&AllocationPlan> {
        self.history.last()
    }

    pub fn history(&self) -> &[AllocationPlan] {
        &self.history
    }

    /// Moves from the previous plan (or current capital, before any plan)
    /// that exceed the rebalance threshold.
    fn rebalancing_actions(
        &self,
        allocations: &HashMap<TargetId, Decimal>,
        filter: Option<TargetType>,
        total_capital: Decimal,
    ) -> Vec<RebalanceAction> {
        let threshold = total_capital * to_decimal(self.config.rebalance_threshold.max(0.0));
        let previous = self.current_plan();

        let from_capital = |id: &TargetId| -> Decimal {
            match previous {
                Some(plan) => plan.allocations.get(id).copied().unwrap_or(Decimal::ZERO),
                None => self
                    .targets
                    .get(id)
                    .map_or(Decimal::ZERO, |t| t.current_capital),
            }
        };

        // Targets the previous plan funded that fall under the same filter
        // but were dropped from this one are drained to zero.
        let mut ids: Vec<&TargetId> = allocations.keys().collect();
        if let Some(plan) = previous {
            ids.extend(plan.allocations.keys().filter(|id| {
                !allocations.contains_key(*id)
                    && self
                        .targets
                        .get(*id)
                        .is_some_and(|t| filter.map_or(true, |f| t.target_type == f))
            }));
        }
        ids.sort();

        ids.into_iter()
            .filter_map(|id| {
                let from = from_capital(id);
                let to = allocations.get(id).copied().unwrap_or(Decimal::ZERO);
                let delta = to - from;
                if delta.abs() <= threshold {
                    return None;
                }
                Some(RebalanceAction {
                    target_id: id.clone(),
                    from_capital: from,
                    to_capital: to,
                    delta,
                    direction: if delta > Decimal::ZERO {
                        RebalanceDirection::Increase
                    } else {
                        RebalanceDirection::Decrease
                    },
                })
            })
            .collect()
    }

    fn target_mut(&mut self, id: &TargetId) -> Result<&mut AllocationTarget> {
        self.targets
            .get_mut(id)
            .ok_or_else(|| AllocationError::UnknownTarget(id.clone()))
    }
}

fn to_decimal(v: f64) -> Decimal {
    Decimal::try_from(v).unwrap_or(Decimal::ZERO)
}

/// Round to cents toward zero so allocations never exceed what is available.
fn round_down(v: Decimal) -> Decimal {
    v.round_dp_with_strategy(2, RoundingStrategy::ToZero)
}

fn share_of(part: Decimal, total: Decimal) -> f64 {
    if total <= Decimal::ZERO {
        return 0.0;
    }
    (part / total).to_f64().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(id: &str, kind: TargetType, sharpe: f64, volatility: f64) -> AllocationTarget {
        let mut t = AllocationTarget::new(id, kind);
        t.metrics.sharpe_ratio = sharpe;
        t.metrics.volatility = volatility;
        t.metrics.avg_return = 0.001;
        t
    }

    fn engine_with(targets: Vec<AllocationTarget>) -> CapitalAllocationEngine {
        let mut engine = CapitalAllocationEngine::new(AllocationConfig::default());
        for t in targets {
            engine.add_target(t).unwrap();
        }
        engine
    }

    fn id(s: &str) -> TargetId {
        TargetId::new(s)
    }

    #[test]
    fn test_equal_weight_plan() {
        let mut engine = engine_with(vec![
            target("momentum", TargetType::Strategy, 1.0, 0.02),
            target("mean_revert", TargetType::Strategy, 0.5, 0.01),
            target("breakout", TargetType::Strategy, 2.0, 0.03),
            target("scalper", TargetType::Strategy, -0.5, 0.04),
        ]);

        let plan = engine
            .create_allocation_plan(AllocationMethod::EqualWeight, None)
            .unwrap();

        assert_eq!(plan.reserve_capital, dec!(1000));
        assert!(plan.allocations.values().all(|c| *c == dec!(2250)));
        assert!((plan.total_pct() - 0.9).abs() < 1e-9);
        assert_eq!(plan.allocated_capital(), dec!(9000));
    }

    #[test]
    fn test_long_supplied_history_is_trimmed_on_add() {
        let mut long = target("momentum", TargetType::Strategy, 1.0, 0.02);
        long.returns_history = (0..150).map(|i| (i % 7) as f64 / 1000.0 - 0.003).collect();
        let mut engine = engine_with(vec![long, target("breakout", TargetType::Strategy, 2.0, 0.03)]);

        assert_eq!(
            engine.target(&id("momentum")).unwrap().returns_history.len(),
            crate::models::RETURN_HISTORY_LEN
        );

        let plan = engine
            .create_allocation_plan(AllocationMethod::SharpeWeighted, None)
            .unwrap();
        assert_eq!(plan.allocations.len(), 2);
        assert!((0.0..=1.0).contains(&plan.diversification_score));
    }

    #[test]
    fn test_all_methods_stay_within_capital() {
        let targets = vec![
            target("a", TargetType::Strategy, 2.5, 0.01),
            target("b", TargetType::Strategy, 1.0, 0.02),
            target("c", TargetType::Strategy, -1.0, 0.05),
        ];

        for method in [
            AllocationMethod::EqualWeight,
            AllocationMethod::SharpeWeighted,
            AllocationMethod::RiskParity,
            AllocationMethod::Kelly,
        ] {
            let mut engine = engine_with(targets.clone());
            let plan = engine.create_allocation_plan(method, None).unwrap();

            assert!(plan.total_pct() <= 1.0 - 0.10 + 1e-9, "{method:?}");
            assert!(plan.allocated_capital() <= dec!(9000), "{method:?}");
            assert!(plan.allocation_pcts.values().all(|p| *p >= 0.0));
        }
    }

    #[test]
    fn test_kelly_leaves_capital_unused() {
        let mut engine = engine_with(vec![
            target("a", TargetType::Strategy, 1.0, 0.02),
            target("b", TargetType::Strategy, 5.0, 0.02),
        ]);

        let plan = engine.create_allocation_plan(AllocationMethod::Kelly, None).unwrap();

        // 0.10 and 0.25 of $9000 available
        assert_eq!(plan.allocations[&id("a")], dec!(900));
        assert_eq!(plan.allocations[&id("b")], dec!(2250));
    }

    #[test]
    fn test_filter_and_inactive_targets() {
        let mut engine = engine_with(vec![
            target("momentum", TargetType::Strategy, 1.0, 0.02),
            target("kraken", TargetType::Broker, 1.0, 0.02),
            target("coinbase", TargetType::Broker, 1.0, 0.02),
        ]);
        engine.set_active(&id("coinbase"), false).unwrap();

        let plan = engine
            .create_allocation_plan(AllocationMethod::EqualWeight, Some(TargetType::Broker))
            .unwrap();
        assert_eq!(plan.allocations.len(), 1);
        assert_eq!(plan.allocations[&id("kraken")], dec!(9000));
        assert_eq!(plan.diversification_score, 0.0);

        let err = engine
            .create_allocation_plan(AllocationMethod::EqualWeight, Some(TargetType::Asset))
            .unwrap_err();
        assert_eq!(err, AllocationError::NoActiveTargets);
    }

    #[test]
    fn test_invalid_bounds_and_unknown_target() {
        let mut engine = engine_with(vec![]);
        let mut bad = target("bad", TargetType::Asset, 1.0, 0.01);
        bad.min_allocation_pct = 0.5;
        bad.max_allocation_pct = 0.2;

        assert!(matches!(engine.add_target(bad), Err(AllocationError::InvalidBounds { .. })));
        assert_eq!(
            engine.update_performance(&id("ghost"), &[0.01]).unwrap_err(),
            AllocationError::UnknownTarget(id("ghost"))
        );
        assert_eq!(
            engine.create_allocation_plan(AllocationMethod::Kelly, None).unwrap_err(),
            AllocationError::NoActiveTargets
        );
    }

    #[test]
    fn test_update_performance_recomputes_metrics() {
        let mut engine = engine_with(vec![target("BTC-USD", TargetType::Asset, 0.0, 0.0)]);
        let returns = [0.01, -0.005, 0.02, 0.0, 0.015];

        let metrics = engine.update_performance(&id("BTC-USD"), &returns).unwrap();
        assert_eq!(metrics.observations, 5);
        assert!((metrics.win_rate - 0.6).abs() < 1e-9);
        assert!(metrics.sharpe_ratio > 0.0);

        engine.update_performance(&id("BTC-USD"), &[0.01]).unwrap();
        let target = engine.target(&id("BTC-USD")).unwrap();
        assert_eq!(target.returns_history.len(), 6);
        assert_eq!(target.metrics.observations, 6);
    }

    #[test]
    fn test_rebalancing_actions_against_previous_plan() {
        let mut engine = engine_with(vec![
            target("a", TargetType::Strategy, 1.0, 0.02),
            target("b", TargetType::Strategy, 1.0, 0.02),
        ]);

        // First plan compares against current capital (zero): both increase
        let first = engine
            .create_allocation_plan(AllocationMethod::EqualWeight, None)
            .unwrap();
        assert_eq!(first.rebalancing_actions.len(), 2);
        assert!(first
            .rebalancing_actions
            .iter()
            .all(|a| a.direction == RebalanceDirection::Increase));
        engine.apply_plan(&first).unwrap();
        assert_eq!(engine.target(&id("a")).unwrap().current_capital, dec!(4500));

        // Same inputs: no move exceeds 5% of total capital
        let same = engine
            .create_allocation_plan(AllocationMethod::EqualWeight, None)
            .unwrap();
        assert!(same.rebalancing_actions.is_empty());

        // Dropping a target drains it
        engine.set_active(&id("b"), false).unwrap();
        let drained = engine
            .create_allocation_plan(AllocationMethod::EqualWeight, None)
            .unwrap();
        let actions: HashMap<_, _> = drained
            .rebalancing_actions
            .iter()
            .map(|a| (a.target_id.as_str().to_string(), a))
            .collect();
        assert_eq!(actions["a"].delta, dec!(4500));
        assert_eq!(actions["b"].direction, RebalanceDirection::Decrease);
        assert_eq!(actions["b"].to_capital, Decimal::ZERO);

        assert_eq!(engine.history().len(), 3);
        assert_eq!(engine.current_plan().unwrap().allocations.len(), 1);
    }

    #[test]
    fn test_apply_plan_rejects_unknown_target() {
        let mut engine = engine_with(vec![target("a", TargetType::Asset, 1.0, 0.02)]);
        let plan = engine
            .create_allocation_plan(AllocationMethod::EqualWeight, None)
            .unwrap();
        engine.remove_target(&id("a"));

        assert_eq!(
            engine.apply_plan(&plan).unwrap_err(),
            AllocationError::UnknownTarget(id("a"))
        );
    }
}
