//! Per-user risk state with lazy day and week rollover.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::RiskConfig;

/// Running PnL, counters and circuit-breaker flag for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRiskState {
    pub user_id: String,

    pub balance: Decimal,
    pub peak_balance: Decimal,
    /// Balance at the first access of the current day
    pub day_start_balance: Decimal,
    /// Balance at the first access of the current ISO week
    pub week_start_balance: Decimal,

    /// Net realized PnL today
    pub daily_pnl: Decimal,
    /// Net realized PnL this week
    pub weekly_pnl: Decimal,
    /// Sum of losing trades today (positive number)
    pub daily_losses: Decimal,

    /// Entries opened today
    pub daily_trades: u32,
    /// Entries opened this week
    pub weekly_trades: u32,
    /// Entries opened since the state was created
    pub total_trades: u64,

    /// Drawdown from peak balance (0.1 = 10%)
    pub drawdown_pct: Decimal,

    pub circuit_breaker: bool,
    pub circuit_breaker_reason: Option<String>,
    pub circuit_breaker_at: Option<DateTime<Utc>>,

    pub last_reset_date: NaiveDate,
    /// ISO (year, week) of the last weekly reset
    pub last_reset_week: (i32, u32),

    pub updated_at: DateTime<Utc>,
}

fn iso_week(now: DateTime<Utc>) -> (i32, u32) {
    let week = now.iso_week();
    (week.year(), week.week())
}

impl UserRiskState {
    pub fn new(user_id: impl Into<String>, balance: Decimal, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            balance,
            peak_balance: balance,
            day_start_balance: balance,
            week_start_balance: balance,
            daily_pnl: Decimal::ZERO,
            weekly_pnl: Decimal::ZERO,
            daily_losses: Decimal::ZERO,
            daily_trades: 0,
            weekly_trades: 0,
            total_trades: 0,
            drawdown_pct: Decimal::ZERO,
            circuit_breaker: false,
            circuit_breaker_reason: None,
            circuit_breaker_at: None,
            last_reset_date: now.date_naive(),
            last_reset_week: iso_week(now),
            updated_at: now,
        }
    }

    /// Reset daily and weekly counters if `now` is in a new day or week.
    ///
    /// A new day is the only automatic way the circuit breaker clears.
    pub fn roll_over(&mut self, now: DateTime<Utc>) -> bool {
        let mut rolled = false;

        let today = now.date_naive();
        if today != self.last_reset_date {
            if self.circuit_breaker {
                info!(user_id = %self.user_id, "Circuit breaker cleared by day rollover");
            }
            self.daily_pnl = Decimal::ZERO;
            self.daily_losses = Decimal::ZERO;
            self.daily_trades = 0;
            self.day_start_balance = self.balance;
            self.clear_circuit_breaker();
            self.last_reset_date = today;
            rolled = true;
        }

        let week = iso_week(now);
        if week != self.last_reset_week {
            self.weekly_pnl = Decimal::ZERO;
            self.weekly_trades = 0;
            self.week_start_balance = self.balance;
            self.last_reset_week = week;
            rolled = true;
        }

        rolled
    }

    /// Count a confirmed entry against the daily and weekly trade limits.
    pub fn record_entry(&mut self, now: DateTime<Utc>) {
        self.roll_over(now);
        self.daily_trades += 1;
        self.weekly_trades += 1;
        self.total_trades += 1;
        self.updated_at = now;
    }

    /// Apply a realized exit result. Partial exits of one position each
    /// report their own PnL but do not count as trades.
    pub fn record_trade(&mut self, pnl: Decimal, config: &RiskConfig, now: DateTime<Utc>) {
        self.roll_over(now);

        self.balance += pnl;
        self.daily_pnl += pnl;
        self.weekly_pnl += pnl;
        if pnl < Decimal::ZERO {
            self.daily_losses += -pnl;
        }
        self.updated_at = now;

        self.update_drawdown();
        self.check_circuit_breaker(config, now);
    }

    /// Set the balance from an external source (e.g. broker account).
    ///
    /// Losses recorded before any balance was known are measured against
    /// the new day-start balance, so the breaker is re-evaluated here.
    pub fn set_balance(&mut self, balance: Decimal, config: &RiskConfig, now: DateTime<Utc>) {
        self.roll_over(now);
        self.balance = balance;
        if self.day_start_balance.is_zero() {
            self.day_start_balance = balance;
        }
        if self.week_start_balance.is_zero() {
            self.week_start_balance = balance;
        }
        self.updated_at = now;
        self.update_drawdown();
        self.check_circuit_breaker(config, now);
    }

    /// Gross daily losses relative to the day's starting balance.
    pub fn daily_loss_ratio(&self) -> Decimal {
        if self.day_start_balance <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        self.daily_losses / self.day_start_balance
    }

    pub fn trip_circuit_breaker(&mut self, reason: String, now: DateTime<Utc>) {
        error!(user_id = %self.user_id, reason = %reason, "Circuit breaker TRIPPED");
        self.circuit_breaker = true;
        self.circuit_breaker_reason = Some(reason);
        self.circuit_breaker_at = Some(now);
    }

    pub fn clear_circuit_breaker(&mut self) {
        self.circuit_breaker = false;
        self.circuit_breaker_reason = None;
        self.circuit_breaker_at = None;
    }

    fn update_drawdown(&mut self) {
        if self.balance > self.peak_balance {
            self.peak_balance = self.balance;
        }
        self.drawdown_pct = if self.peak_balance > Decimal::ZERO {
            ((self.peak_balance - self.balance) / self.peak_balance).max(Decimal::ZERO)
        } else {
            Decimal::ZERO
        };
    }

    fn check_circuit_breaker(&mut self, config: &RiskConfig, now: DateTime<Utc>) {
        if self.circuit_breaker {
            return;
        }
        let ratio = self.daily_loss_ratio();
        if ratio >= config.circuit_breaker_loss_pct {
            let reason = format!(
                "daily losses ${} are {:.2}% of ${} (limit {:.2}%)",
                self.daily_losses.round_dp(2),
                ratio * Decimal::ONE_HUNDRED,
                self.day_start_balance.round_dp(2),
                config.circuit_breaker_loss_pct * Decimal::ONE_HUNDRED
            );
            self.trip_circuit_breaker(reason, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn monday() -> DateTime<Utc> {
        // 2026-03-02 is a Monday
        Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap()
    }

    #[test]
    fn test_record_trade_updates_counters() {
        let config = RiskConfig::default();
        let mut state = UserRiskState::new("alice", dec!(1000), monday());

        state.record_entry(monday());
        state.record_trade(dec!(50), &config, monday());
        state.record_trade(dec!(-20), &config, monday());

        assert_eq!(state.balance, dec!(1030));
        assert_eq!(state.peak_balance, dec!(1050));
        assert_eq!(state.daily_pnl, dec!(30));
        assert_eq!(state.daily_losses, dec!(20));
        // Two exits of one entry are a single trade
        assert_eq!(state.daily_trades, 1);
        assert_eq!(state.total_trades, 1);
        assert!(state.drawdown_pct > Decimal::ZERO);
        assert!(!state.circuit_breaker);
    }

    #[test]
    fn test_day_and_week_rollover() {
        let config = RiskConfig::default();
        let mut state = UserRiskState::new("alice", dec!(1000), monday());
        state.record_entry(monday());
        state.record_trade(dec!(-40), &config, monday());
        assert!(state.circuit_breaker);
        assert_eq!(state.daily_trades, 1);

        // Next day, same week
        let tuesday = monday() + Duration::days(1);
        assert!(state.roll_over(tuesday));
        assert!(!state.circuit_breaker);
        assert_eq!(state.daily_trades, 0);
        assert_eq!(state.day_start_balance, dec!(960));
        assert_eq!(state.weekly_pnl, dec!(-40));

        // Next week
        let next_monday = monday() + Duration::days(7);
        state.roll_over(next_monday);
        assert_eq!(state.weekly_pnl, Decimal::ZERO);
        assert_eq!(state.week_start_balance, dec!(960));

        // Same instant again is a no-op
        assert!(!state.roll_over(next_monday));
    }

    #[test]
    fn test_losses_before_balance_trip_on_set_balance() {
        let config = RiskConfig::default();
        let mut state = UserRiskState::new("alice", Decimal::ZERO, monday());
        state.record_trade(dec!(-35), &config, monday());
        assert!(!state.circuit_breaker);

        state.set_balance(dec!(1000), &config, monday());

        assert_eq!(state.day_start_balance, dec!(1000));
        assert!(state.circuit_breaker);
    }
}
