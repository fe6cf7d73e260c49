//! Stepped profit-taking ladder.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::models::{Position, CLOSED_THRESHOLD};

/// One rung: exit `exit_fraction` of what is still open once gross return
/// reaches `threshold`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfitLevel {
    pub threshold: Decimal,
    pub exit_fraction: Decimal,
}

impl ProfitLevel {
    pub const fn new(threshold: Decimal, exit_fraction: Decimal) -> Self {
        Self {
            threshold,
            exit_fraction,
        }
    }

    /// Share of the original size to sell when `remaining` is still open.
    ///
    /// Capped so the position stays above the closed threshold; closing is
    /// left to take-profit, stop-loss or an explicit full exit.
    pub fn tranche(&self, remaining: Decimal) -> Decimal {
        (self.exit_fraction * remaining)
            .min(remaining - CLOSED_THRESHOLD)
            .max(Decimal::ZERO)
    }

    /// Reason tag written to the ledger, e.g. `tp_exit_2.5pct`.
    pub fn reason(&self) -> String {
        format!("tp_exit_{}pct", (self.threshold * dec!(100)).normalize())
    }
}

/// A level that should fire now.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LadderHit {
    pub index: usize,
    pub level: ProfitLevel,
    pub net_return: Decimal,
}

/// Fee-aware stepped exit ladder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfitLadder {
    pub levels: Vec<ProfitLevel>,
    /// Entry plus exit fees as a fraction of notional
    pub round_trip_fee: Decimal,
}

impl Default for ProfitLadder {
    fn default() -> Self {
        Self {
            levels: vec![
                ProfitLevel::new(dec!(0.020), dec!(0.10)),
                ProfitLevel::new(dec!(0.025), dec!(0.15)),
                ProfitLevel::new(dec!(0.030), dec!(0.25)),
                ProfitLevel::new(dec!(0.040), dec!(0.50)),
            ],
            round_trip_fee: dec!(0.014), // 1.4%
        }
    }
}

impl ProfitLadder {
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Levels that are reached at `price` and have not fired yet, lowest first.
    ///
    /// A level only qualifies when the return is still positive after the
    /// round-trip fee.
    pub fn pending_hits(&self, position: &Position, price: Decimal) -> Vec<LadderHit> {
        let gross = position.gross_return(price);
        let net = gross - self.round_trip_fee;
        if net <= Decimal::ZERO {
            return Vec::new();
        }

        self.levels
            .iter()
            .enumerate()
            .filter(|(i, level)| {
                gross >= level.threshold && !position.ladder_hits.get(*i).copied().unwrap_or(true)
            })
            .map(|(index, level)| LadderHit {
                index,
                level: *level,
                net_return: net,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderSide;

    fn position() -> Position {
        Position::new(
            "alice".to_string(),
            "BTC-USD".to_string(),
            OrderSide::Buy,
            dec!(100),
            dec!(1),
            dec!(95),
            dec!(110),
            4,
            "o-1".to_string(),
        )
    }

    #[test]
    fn test_levels_by_gross_return() {
        let ladder = ProfitLadder::default();
        let pos = position();

        assert!(ladder.pending_hits(&pos, dec!(101.9)).is_empty());
        assert_eq!(ladder.pending_hits(&pos, dec!(102)).len(), 1);
        assert_eq!(ladder.pending_hits(&pos, dec!(103.1)).len(), 3);
        assert_eq!(ladder.pending_hits(&pos, dec!(105)).len(), 4);
    }

    #[test]
    fn test_fired_levels_are_skipped() {
        let ladder = ProfitLadder::default();
        let mut pos = position();
        pos.ladder_hits[0] = true;

        let hits = ladder.pending_hits(&pos, dec!(102.6));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].index, 1);
        assert_eq!(hits[0].level.reason(), "tp_exit_2.5pct");
    }

    #[test]
    fn test_tranches_shrink_with_remaining_and_never_close() {
        let ladder = ProfitLadder::default();
        let mut remaining = Decimal::ONE;
        for level in &ladder.levels {
            remaining -= level.tranche(remaining);
        }
        assert_eq!(remaining, dec!(0.286875));

        // A full-size rung still leaves the position open
        let all_out = ProfitLevel::new(dec!(0.02), Decimal::ONE);
        assert_eq!(all_out.tranche(Decimal::ONE), dec!(0.99));
        assert_eq!(all_out.tranche(dec!(0.005)), Decimal::ZERO);
    }

    #[test]
    fn test_fee_gate_blocks_unprofitable_levels() {
        let ladder = ProfitLadder {
            levels: vec![ProfitLevel::new(dec!(0.01), dec!(0.5))],
            round_trip_fee: dec!(0.014),
        };
        // 1.2% gross is past the level but negative after fees
        assert!(ladder.pending_hits(&position(), dec!(101.2)).is_empty());
        assert_eq!(ladder.pending_hits(&position(), dec!(101.5)).len(), 1);
    }
}
