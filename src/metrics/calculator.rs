//! Calculator for performance metrics: Sharpe, Sortino, drawdown, win rate, etc.

use chrono::Utc;
use statrs::statistics::Statistics;

use crate::models::PerformanceMetrics;

/// Periods per year used to annualize Sharpe and Sortino (daily returns).
pub const DEFAULT_PERIODS_PER_YEAR: f64 = 365.0;

/// Calculator for computing performance metrics from per-period returns.
pub struct MetricsCalculator;

impl MetricsCalculator {
    /// Calculate metrics from per-period returns (0.01 = 1%).
    pub fn calculate(returns: &[f64]) -> PerformanceMetrics {
        Self::calculate_with_periods(returns, DEFAULT_PERIODS_PER_YEAR)
    }

    /// Calculate metrics, annualizing ratios with `periods_per_year`.
    pub fn calculate_with_periods(returns: &[f64], periods_per_year: f64) -> PerformanceMetrics {
        let mut metrics = PerformanceMetrics::new();

        let returns: Vec<f64> = returns.iter().copied().filter(|r| r.is_finite()).collect();
        if returns.is_empty() {
            return metrics;
        }

        metrics.observations = returns.len() as u32;
        metrics.avg_return = returns.iter().mean();

        Self::calculate_win_loss(&mut metrics, &returns);
        Self::calculate_drawdown(&mut metrics, &returns);
        Self::calculate_sharpe_sortino(&mut metrics, &returns, periods_per_year);

        metrics.calculated_at = Utc::now();
        metrics
    }

    /// Win rate and profit factor.
    fn calculate_win_loss(metrics: &mut PerformanceMetrics, returns: &[f64]) {
        let (gains, losses): (Vec<f64>, Vec<f64>) = returns.iter().partition(|&&r| r > 0.0);

        metrics.win_rate = gains.len() as f64 / returns.len() as f64;

        let gross_profit: f64 = gains.iter().sum();
        let gross_loss: f64 = losses.iter().map(|l| l.abs()).sum();
        if gross_loss > 0.0 {
            metrics.profit_factor = gross_profit / gross_loss;
        } else if gross_profit > 0.0 {
            metrics.profit_factor = f64::INFINITY;
        }
    }

    /// Maximum drawdown of the compounded equity curve.
    fn calculate_drawdown(metrics: &mut PerformanceMetrics, returns: &[f64]) {
        let mut equity = 1.0f64;
        let mut peak = 1.0f64;
        let mut max_dd = 0.0f64;

        for r in returns {
            equity *= 1.0 + r;
            if equity > peak {
                peak = equity;
            }
            if peak > 0.0 {
                max_dd = max_dd.max((peak - equity) / peak);
            }
        }

        metrics.max_drawdown = max_dd;
    }

    /// Calculate Sharpe and Sortino ratios (0% risk-free rate).
    fn calculate_sharpe_sortino(
        metrics: &mut PerformanceMetrics,
        returns: &[f64],
        periods_per_year: f64,
    ) {
        if returns.len() < 2 {
            return;
        }

        let mean = metrics.avg_return;
        let std_dev = returns.iter().std_dev();
        metrics.volatility = std_dev;

        let annualizer = periods_per_year.sqrt();

        if std_dev > 0.0 {
            metrics.sharpe_ratio = (mean / std_dev) * annualizer;
        }

        // Downside deviation over all periods, counting gains as zero
        let downside: f64 = returns
            .iter()
            .map(|r| r.min(0.0).powi(2))
            .sum::<f64>()
            / returns.len() as f64;
        let downside_dev = downside.sqrt();
        if downside_dev > 0.0 {
            metrics.sortino_ratio = (mean / downside_dev) * annualizer;
        }
    }

    /// Pearson correlation of two equally long series.
    ///
    /// Returns 0.0 when either series is constant or the lengths differ.
    pub fn correlation(a: &[f64], b: &[f64]) -> f64 {
        if a.len() != b.len() || a.len() < 2 {
            return 0.0;
        }

        let sd_a = a.iter().std_dev();
        let sd_b = b.iter().std_dev();
        if sd_a <= 0.0 || sd_b <= 0.0 || !sd_a.is_finite() || !sd_b.is_finite() {
            return 0.0;
        }

        let cov = a.iter().covariance(b.iter());
        let corr = cov / (sd_a * sd_b);
        if corr.is_finite() {
            corr.clamp(-1.0, 1.0)
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_win_loss() {
        let returns = vec![0.02, -0.01, 0.03, -0.02, 0.01];
        let metrics = MetricsCalculator::calculate(&returns);

        assert_eq!(metrics.observations, 5);
        assert!((metrics.win_rate - 0.6).abs() < 1e-9);
        assert!((metrics.profit_factor - 2.0).abs() < 1e-9);
        assert!((metrics.avg_return - 0.006).abs() < 1e-9);
        assert!(metrics.sharpe_ratio > 0.0);
        assert!(metrics.sortino_ratio > metrics.sharpe_ratio);
    }

    #[test]
    fn test_calculate_drawdown() {
        // Equity: 1.10 -> 0.99 -> 0.891 -> 0.98
        let returns = vec![0.10, -0.10, -0.10, 0.10];
        let metrics = MetricsCalculator::calculate(&returns);

        // Max drawdown from 1.10 to 0.891 = 19%
        assert!((metrics.max_drawdown - 0.19).abs() < 1e-9);
    }

    #[test]
    fn test_empty_and_single_return() {
        let empty = MetricsCalculator::calculate(&[]);
        assert_eq!(empty.observations, 0);
        assert_eq!(empty.sharpe_ratio, 0.0);

        let single = MetricsCalculator::calculate(&[0.05]);
        assert_eq!(single.observations, 1);
        assert_eq!(single.volatility, 0.0);
        assert_eq!(single.sharpe_ratio, 0.0);
    }

    #[test]
    fn test_correlation() {
        let a = vec![0.01, 0.02, 0.03, 0.04];
        let b = vec![0.02, 0.04, 0.06, 0.08];
        let c = vec![0.04, 0.03, 0.02, 0.01];
        let flat = vec![0.0; 4];

        assert!((MetricsCalculator::correlation(&a, &b) - 1.0).abs() < 1e-9);
        assert!((MetricsCalculator::correlation(&a, &c) + 1.0).abs() < 1e-9);
        assert_eq!(MetricsCalculator::correlation(&a, &flat), 0.0);
        assert_eq!(MetricsCalculator::correlation(&a, &b[..3]), 0.0);
    }
}
