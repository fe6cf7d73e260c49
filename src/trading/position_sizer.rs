//! Position sizing: fixed fraction, signal-score scaled, fractional Kelly.

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal_macros::dec;

use super::SizingConfig;
use crate::models::PerformanceMetrics;
use crate::signals::MAX_SCORE;

/// Position sizing method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizingMethod {
    /// Fixed percentage of balance
    FixedFraction,
    /// Fixed percentage scaled by signal score / 5
    ScoreScaled,
    /// Fractional Kelly from win rate and profit factor
    Kelly,
}

impl SizingMethod {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "kelly" => Self::Kelly,
            "score" | "score_scaled" => Self::ScoreScaled,
            _ => Self::FixedFraction,
        }
    }
}

/// Calculator for entry sizes in USD.
pub struct PositionSizer {
    config: SizingConfig,
    method: SizingMethod,
}

impl PositionSizer {
    pub fn new(config: SizingConfig) -> Self {
        let method = SizingMethod::from_str(&config.sizing_method);
        Self { config, method }
    }

    pub fn method(&self) -> SizingMethod {
        self.method
    }

    /// Calculate the size of a new entry.
    ///
    /// # Arguments
    /// * `balance` - Current account balance in USD
    /// * `score` - Signal score of the entry (0 to 5)
    /// * `metrics` - Trailing performance of the strategy, used by Kelly
    /// * `current_exposure` - Notional already deployed in open positions
    ///
    /// # Returns
    /// Recommended position size in USD, or zero to skip the entry
    pub fn calculate_size(
        &self,
        balance: Decimal,
        score: u8,
        metrics: Option<&PerformanceMetrics>,
        current_exposure: Decimal,
    ) -> Decimal {
        if balance <= Decimal::ZERO {
            return Decimal::ZERO;
        }

        let base_size = balance * self.config.position_pct;

        let sized = match self.method {
            SizingMethod::FixedFraction => base_size,
            SizingMethod::ScoreScaled => {
                base_size * Decimal::from(score.min(MAX_SCORE)) / Decimal::from(MAX_SCORE)
            }
            SizingMethod::Kelly => self.kelly_size(base_size, metrics, balance),
        };

        if sized <= Decimal::ZERO {
            return Decimal::ZERO;
        }

        self.apply_constraints(sized, balance, current_exposure)
    }

    /// Fractional Kelly.
    ///
    /// With payoff ratio b = W/L and profit factor PF = pW / qL,
    /// f* = p - q/b = p * (1 - 1/PF).
    fn kelly_size(
        &self,
        base_size: Decimal,
        metrics: Option<&PerformanceMetrics>,
        balance: Decimal,
    ) -> Decimal {
        let Some(m) = metrics else {
            return base_size * dec!(0.5); // Conservative until there is history
        };

        if m.profit_factor <= 1.0 || m.win_rate <= 0.0 {
            return Decimal::ZERO; // No edge
        }

        let kelly = if m.profit_factor.is_finite() {
            m.win_rate * (1.0 - 1.0 / m.profit_factor)
        } else {
            m.win_rate
        };

        let adjusted = kelly * self.config.kelly_fraction.to_f64().unwrap_or(0.25);

        // Scale down while in drawdown
        let drawdown_penalty = 1.0 - m.max_drawdown.min(0.9);

        balance * Decimal::try_from(adjusted * drawdown_penalty).unwrap_or(Decimal::ZERO)
    }

    /// Apply trade size and total allocation limits.
    fn apply_constraints(
        &self,
        size: Decimal,
        balance: Decimal,
        current_exposure: Decimal,
    ) -> Decimal {
        let mut final_size = size;

        final_size = final_size.max(self.config.min_trade_size);
        final_size = final_size.min(self.config.max_trade_size);

        let max_total = balance * self.config.max_portfolio_allocation;
        let remaining_capacity = max_total - current_exposure;
        if remaining_capacity <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        final_size = final_size.min(remaining_capacity);

        if final_size < self.config.min_trade_size {
            return Decimal::ZERO;
        }

        final_size.round_dp(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizer(method: &str) -> PositionSizer {
        PositionSizer::new(SizingConfig {
            sizing_method: method.to_string(),
            ..Default::default()
        })
    }

    #[test]
    fn test_fixed_fraction() {
        let size = sizer("fixed").calculate_size(dec!(2000), 3, None, Decimal::ZERO);
        assert_eq!(size, dec!(100)); // 5% of $2000
    }

    #[test]
    fn test_score_scaled() {
        let s = sizer("score");
        assert_eq!(s.method(), SizingMethod::ScoreScaled);

        assert_eq!(s.calculate_size(dec!(2000), 5, None, Decimal::ZERO), dec!(100));
        assert_eq!(s.calculate_size(dec!(2000), 4, None, Decimal::ZERO), dec!(80));
        assert_eq!(s.calculate_size(dec!(2000), 0, None, Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn test_kelly_sizing() {
        let s = sizer("kelly");

        let mut metrics = PerformanceMetrics::new();
        metrics.win_rate = 0.6;
        metrics.profit_factor = 2.0;
        metrics.max_drawdown = 0.0;

        // 0.6 * (1 - 1/2) = 0.3, quarter Kelly = 7.5% of $2000
        let size = s.calculate_size(dec!(2000), 3, Some(&metrics), Decimal::ZERO);
        assert_eq!(size, dec!(150));

        metrics.profit_factor = 0.8;
        assert_eq!(s.calculate_size(dec!(2000), 3, Some(&metrics), Decimal::ZERO), Decimal::ZERO);

        // No history: half the base size
        assert_eq!(s.calculate_size(dec!(2000), 3, None, Decimal::ZERO), dec!(50));
    }

    #[test]
    fn test_constraints() {
        let s = PositionSizer::new(SizingConfig {
            position_pct: dec!(0.5),
            max_trade_size: dec!(300),
            ..Default::default()
        });

        // Capped at max trade size
        assert_eq!(s.calculate_size(dec!(1000), 3, None, Decimal::ZERO), dec!(300));
        // Capped at remaining capacity (50% of $1000 - $400)
        assert_eq!(s.calculate_size(dec!(1000), 3, None, dec!(400)), dec!(100));
        // No capacity left
        assert_eq!(s.calculate_size(dec!(1000), 3, None, dec!(500)), Decimal::ZERO);

        // 5% of $100 is bumped to the minimum trade size
        assert_eq!(sizer("fixed").calculate_size(dec!(100), 3, None, Decimal::ZERO), dec!(10));
    }
}
