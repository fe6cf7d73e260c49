//! Expected portfolio statistics for a set of weighted targets.

use crate::metrics::MetricsCalculator;
use crate::models::AllocationTarget;

/// Weight on concentration in the diversification score.
const CONCENTRATION_WEIGHT: f64 = 0.6;
/// Weight on correlation in the diversification score.
const CORRELATION_WEIGHT: f64 = 0.4;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PortfolioStats {
    pub expected_return: f64,
    pub expected_volatility: f64,
    pub expected_sharpe: f64,
}

/// Expected return, volatility and Sharpe assuming uncorrelated targets.
///
/// `weights` are shares of total capital; unallocated capital earns nothing.
pub fn expected_stats(
    targets: &[&AllocationTarget],
    weights: &[f64],
    periods_per_year: f64,
) -> PortfolioStats {
    let expected_return: f64 = targets
        .iter()
        .zip(weights)
        .map(|(t, w)| w * t.metrics.avg_return)
        .sum();

    let variance: f64 = targets
        .iter()
        .zip(weights)
        .map(|(t, w)| (w * t.metrics.volatility).powi(2))
        .sum();
    let expected_volatility = variance.sqrt();

    let expected_sharpe = if expected_volatility > 0.0 {
        expected_return / expected_volatility * periods_per_year.sqrt()
    } else {
        0.0
    };

    PortfolioStats {
        expected_return,
        expected_volatility,
        expected_sharpe,
    }
}

/// Diversification score in [0, 1].
///
/// Blends how evenly capital is spread (normalized Herfindahl index) with
/// how uncorrelated the targets' return histories are. A single target
/// scores 0.
pub fn diversification_score(targets: &[&AllocationTarget], weights: &[f64]) -> f64 {
    let n = targets.len();
    let total: f64 = weights.iter().sum();
    if n < 2 || total <= 0.0 {
        return 0.0;
    }

    let hhi: f64 = weights.iter().map(|w| (w / total).powi(2)).sum();
    let floor = 1.0 / n as f64;
    let concentration = ((hhi - floor) / (1.0 - floor)).clamp(0.0, 1.0);

    let avg_corr = average_correlation(targets);

    let score = CONCENTRATION_WEIGHT * (1.0 - concentration)
        + CORRELATION_WEIGHT * (1.0 - avg_corr.max(0.0));
    score.clamp(0.0, 1.0)
}

/// Mean pairwise correlation of the padded return histories.
pub fn average_correlation(targets: &[&AllocationTarget]) -> f64 {
    let series: Vec<Vec<f64>> = targets.iter().map(|t| t.padded_returns()).collect();

    let mut sum = 0.0;
    let mut pairs = 0usize;
    for i in 0..series.len() {
        for j in (i + 1)..series.len() {
            sum += MetricsCalculator::correlation(&series[i], &series[j]);
            pairs += 1;
        }
    }

    if pairs == 0 { 0.0 } else { sum / pairs as f64 }
}
