//! Weighting schemes.
//!
//! Each function returns one weight per target as a share of the capital
//! available after the reserve. Weights sum to at most 1.

use crate::models::{AllocationMethod, AllocationTarget};

/// Sharpe floor so weak but positive-expectancy targets keep some weight.
const MIN_SHARPE_WEIGHT: f64 = 0.1;

/// Volatility floor for risk parity.
const MIN_VOLATILITY: f64 = 0.01;

const KELLY_MIN: f64 = 0.01;
const KELLY_MAX: f64 = 0.25;

pub fn weights(method: AllocationMethod, targets: &[&AllocationTarget]) -> Vec<f64> {
    match method {
        AllocationMethod::EqualWeight => equal_weight(targets),
        AllocationMethod::SharpeWeighted => sharpe_weighted(targets),
        AllocationMethod::RiskParity => risk_parity(targets),
        AllocationMethod::Kelly => kelly(targets),
    }
}

pub fn equal_weight(targets: &[&AllocationTarget]) -> Vec<f64> {
    if targets.is_empty() {
        return Vec::new();
    }
    vec![1.0 / targets.len() as f64; targets.len()]
}

/// Weight proportional to max(0.1, Sharpe).
pub fn sharpe_weighted(targets: &[&AllocationTarget]) -> Vec<f64> {
    let raw: Vec<f64> = targets
        .iter()
        .map(|t| finite_or(t.metrics.sharpe_ratio, 0.0).max(MIN_SHARPE_WEIGHT))
        .collect();
    clip_and_renormalize(targets, &raw)
}

/// Weight proportional to 1 / volatility.
pub fn risk_parity(targets: &[&AllocationTarget]) -> Vec<f64> {
    let raw: Vec<f64> = targets
        .iter()
        .map(|t| 1.0 / finite_or(t.metrics.volatility, MIN_VOLATILITY).max(MIN_VOLATILITY))
        .collect();
    clip_and_renormalize(targets, &raw)
}

/// Sharpe / 10 clamped to [1%, 25%], normalized only when over-committed.
pub fn kelly(targets: &[&AllocationTarget]) -> Vec<f64> {
    let raw: Vec<f64> = targets
        .iter()
        .map(|t| (finite_or(t.metrics.sharpe_ratio, 0.0) / 10.0).clamp(KELLY_MIN, KELLY_MAX))
        .collect();

    let sum: f64 = raw.iter().sum();
    if sum > 1.0 {
        raw.iter().map(|w| w / sum).collect()
    } else {
        raw
    }
}

/// Normalize, clip each weight to its target's band, then renormalize so
/// the weights consume all available capital.
fn clip_and_renormalize(targets: &[&AllocationTarget], raw: &[f64]) -> Vec<f64> {
    let sum: f64 = raw.iter().sum();
    if targets.is_empty() || sum <= 0.0 {
        return equal_weight(targets);
    }

    let clipped: Vec<f64> = targets
        .iter()
        .zip(raw)
        .map(|(t, r)| (r / sum).clamp(t.min_allocation_pct, t.max_allocation_pct))
        .collect();

    let clipped_sum: f64 = clipped.iter().sum();
    if clipped_sum <= 0.0 {
        return equal_weight(targets);
    }
    clipped.iter().map(|w| w / clipped_sum).collect()
}

fn finite_or(v: f64, default: f64) -> f64 {
    if v.is_finite() { v } else { default }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TargetType;

    fn target(id: &str, sharpe: f64, volatility: f64) -> AllocationTarget {
        let mut t = AllocationTarget::new(id, TargetType::Strategy);
        t.metrics.sharpe_ratio = sharpe;
        t.metrics.volatility = volatility;
        t
    }

    fn sum(w: &[f64]) -> f64 {
        w.iter().sum()
    }

    #[test]
    fn test_equal_weight() {
        let (a, b, c) = (target("a", 1.0, 0.01), target("b", 2.0, 0.02), target("c", 3.0, 0.03));
        let w = equal_weight(&[&a, &b, &c]);
        assert!(w.iter().all(|x| (x - 1.0 / 3.0).abs() < 1e-12));
        assert!(equal_weight(&[]).is_empty());
    }

    #[test]
    fn test_sharpe_weighted_floor_and_clip() {
        let (a, b, c) = (target("a", 2.0, 0.01), target("b", 1.0, 0.01), target("c", -1.0, 0.01));
        let w = sharpe_weighted(&[&a, &b, &c]);

        assert!((sum(&w) - 1.0).abs() < 1e-12);
        assert!(w[0] > w[1] && w[1] > w[2]);
        // Negative Sharpe floored at 0.1 then lifted to the 5% band floor
        // before renormalization: 0.05 / (0.40 + 1/3.1 + 0.05)
        let expected_c = 0.05 / (0.40 + 1.0 / 3.1 + 0.05);
        assert!((w[2] - expected_c).abs() < 1e-9);
    }

    #[test]
    fn test_risk_parity_prefers_low_volatility() {
        let (a, b, c) = (target("a", 1.0, 0.01), target("b", 1.0, 0.02), target("c", 1.0, 0.04));
        let w = risk_parity(&[&a, &b, &c]);

        assert!((sum(&w) - 1.0).abs() < 1e-12);
        assert!(w[0] > w[1] && w[1] > w[2]);

        // Zero volatility is floored, not infinite
        let flat = target("flat", 1.0, 0.0);
        let w = risk_parity(&[&flat, &a]);
        assert!((w[0] - w[1]).abs() < 1e-12);
    }

    #[test]
    fn test_kelly_clamp_and_normalize() {
        let (a, b, c) = (target("a", 1.0, 0.0), target("b", 0.05, 0.0), target("c", 5.0, 0.0));
        let w = kelly(&[&a, &b, &c]);
        assert_eq!(w, vec![0.1, 0.01, 0.25]);

        let strong: Vec<AllocationTarget> = (0..6).map(|i| target(&i.to_string(), 3.0, 0.0)).collect();
        let refs: Vec<&AllocationTarget> = strong.iter().collect();
        let w = kelly(&refs);
        assert!((sum(&w) - 1.0).abs() < 1e-12);
        assert!(w.iter().all(|x| (x - 1.0 / 6.0).abs() < 1e-12));
    }
}
