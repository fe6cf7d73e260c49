//! Per-user risk gate.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use super::{RiskConfig, UserRiskState};
use crate::db::Database;

/// Outcome of a `can_trade` check: allowed, or the first failing reason.
pub type TradeDecision = (bool, Option<String>);

/// Tracks risk state per user and gates new entries.
pub struct UserRiskManager {
    default_config: RiskConfig,
    user_configs: DashMap<String, RiskConfig>,
    states: DashMap<String, UserRiskState>,
}

impl UserRiskManager {
    pub fn new(default_config: RiskConfig) -> Self {
        Self {
            default_config,
            user_configs: DashMap::new(),
            states: DashMap::new(),
        }
    }

    /// Effective limits for `user_id`.
    pub fn config_for(&self, user_id: &str) -> RiskConfig {
        self.user_configs
            .get(user_id)
            .map(|c| c.value().clone())
            .unwrap_or_else(|| self.default_config.clone())
    }

    /// Override limits for one user.
    pub fn set_user_config(&self, user_id: &str, config: RiskConfig) {
        self.user_configs.insert(user_id.to_string(), config);
    }

    /// Check whether `user_id` may open a position of `position_size`.
    pub fn can_trade(&self, user_id: &str, position_size: Decimal, open_positions: usize) -> TradeDecision {
        self.can_trade_at(user_id, position_size, open_positions, Utc::now())
    }

    pub fn can_trade_at(
        &self,
        user_id: &str,
        position_size: Decimal,
        open_positions: usize,
        now: DateTime<Utc>,
    ) -> TradeDecision {
        let config = self.config_for(user_id);

        let Some(mut state) = self.states.get_mut(user_id) else {
            return (false, Some(format!("No risk state for {}, balance unknown", user_id)));
        };
        state.roll_over(now);

        let decision = evaluate(&state, &config, position_size, open_positions);
        match &decision {
            (true, _) => debug!(user_id = %user_id, size = %position_size, "Risk check passed"),
            (false, Some(reason)) => warn!(user_id = %user_id, size = %position_size, reason = %reason, "Risk check failed"),
            (false, None) => {}
        }
        decision
    }

    /// Record a realized trade result. Returns true if this trade tripped
    /// the circuit breaker.
    pub fn record_trade(&self, user_id: &str, pnl: Decimal) -> bool {
        self.record_trade_at(user_id, pnl, Utc::now())
    }

    pub fn record_trade_at(&self, user_id: &str, pnl: Decimal, now: DateTime<Utc>) -> bool {
        let config = self.config_for(user_id);
        let mut state = self
            .states
            .entry(user_id.to_string())
            .or_insert_with(|| UserRiskState::new(user_id, Decimal::ZERO, now));

        let was_tripped = state.circuit_breaker;
        state.record_trade(pnl, &config, now);

        debug!(
            user_id = %user_id,
            pnl = %pnl,
            balance = %state.balance,
            daily_pnl = %state.daily_pnl,
            "Trade recorded"
        );
        !was_tripped && state.circuit_breaker
    }

    /// Count a confirmed entry for `user_id`. Only entries count toward
    /// `max_daily_trades`; exits are recorded through `record_trade`.
    pub fn record_entry(&self, user_id: &str) {
        self.record_entry_at(user_id, Utc::now());
    }

    pub fn record_entry_at(&self, user_id: &str, now: DateTime<Utc>) {
        if let Some(mut state) = self.states.get_mut(user_id) {
            state.record_entry(now);
            debug!(user_id = %user_id, daily_trades = state.daily_trades, "Entry recorded");
        }
    }

    /// Set a user's balance, creating their state if needed.
    pub fn update_balance(&self, user_id: &str, balance: Decimal) {
        self.update_balance_at(user_id, balance, Utc::now());
    }

    pub fn update_balance_at(&self, user_id: &str, balance: Decimal, now: DateTime<Utc>) {
        let config = self.config_for(user_id);
        self.states
            .entry(user_id.to_string())
            .and_modify(|s| s.set_balance(balance, &config, now))
            .or_insert_with(|| UserRiskState::new(user_id, balance, now));
    }

    /// Manually clear a tripped circuit breaker.
    pub fn reset_circuit_breaker(&self, user_id: &str) -> bool {
        match self.states.get_mut(user_id) {
            Some(mut state) if state.circuit_breaker => {
                state.clear_circuit_breaker();
                info!(user_id = %user_id, "Circuit breaker manually reset");
                true
            }
            _ => false,
        }
    }

    /// Manually trip the circuit breaker.
    pub fn trip_circuit_breaker(&self, user_id: &str, reason: &str) {
        if let Some(mut state) = self.states.get_mut(user_id) {
            state.trip_circuit_breaker(format!("manual: {}", reason), Utc::now());
        }
    }

    /// Snapshot of a user's state after applying any pending rollover.
    pub fn get_state(&self, user_id: &str) -> Option<UserRiskState> {
        self.get_state_at(user_id, Utc::now())
    }

    pub fn get_state_at(&self, user_id: &str, now: DateTime<Utc>) -> Option<UserRiskState> {
        self.states.get_mut(user_id).map(|mut s| {
            s.roll_over(now);
            s.clone()
        })
    }

    pub fn users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.states.iter().map(|e| e.key().clone()).collect();
        users.sort();
        users
    }

    /// Persist every user's state.
    pub async fn save(&self, db: &Database) -> Result<()> {
        let snapshots: Vec<UserRiskState> = self.states.iter().map(|e| e.value().clone()).collect();
        for state in snapshots {
            let json = serde_json::to_string(&state).context("Failed to serialize risk state")?;
            db.save_risk_state(&state.user_id, &json).await?;
        }
        Ok(())
    }

    /// Load saved states, replacing any in memory. Returns how many loaded.
    pub async fn load(&self, db: &Database) -> Result<usize> {
        let rows = db.load_risk_states().await?;
        let count = rows.len();
        for (user_id, json) in rows {
            let state: UserRiskState = serde_json::from_str(&json)
                .with_context(|| format!("Invalid risk state for {}", user_id))?;
            self.states.insert(user_id, state);
        }
        info!(count, "Loaded risk states");
        Ok(count)
    }
}

/// Apply the checks in order; the first failure wins.
fn evaluate(
    state: &UserRiskState,
    config: &RiskConfig,
    position_size: Decimal,
    open_positions: usize,
) -> TradeDecision {
    let hundred = Decimal::ONE_HUNDRED;

    if state.circuit_breaker {
        return deny(format!(
            "Circuit breaker triggered: {}",
            state.circuit_breaker_reason.as_deref().unwrap_or("daily loss limit")
        ));
    }

    if open_positions >= config.max_open_positions {
        return deny(format!(
            "Max open positions reached ({}/{})",
            open_positions, config.max_open_positions
        ));
    }

    if state.daily_trades >= config.max_daily_trades {
        return deny(format!(
            "Max daily trades reached ({}/{})",
            state.daily_trades, config.max_daily_trades
        ));
    }

    let min_size = state.balance * config.min_position_pct;
    let max_size = state.balance * config.max_position_pct;
    if position_size < min_size {
        return deny(format!(
            "Position size ${} below minimum ${} ({}% of balance)",
            position_size.round_dp(2),
            min_size.round_dp(2),
            (config.min_position_pct * hundred).normalize()
        ));
    }
    if position_size > max_size {
        return deny(format!(
            "Position size ${} above maximum ${} ({}% of balance)",
            position_size.round_dp(2),
            max_size.round_dp(2),
            (config.max_position_pct * hundred).normalize()
        ));
    }

    let daily_loss = (-state.daily_pnl).max(Decimal::ZERO);
    if daily_loss >= config.max_daily_loss_usd {
        return deny(format!(
            "Daily loss ${} reached limit ${}",
            daily_loss.round_dp(2),
            config.max_daily_loss_usd
        ));
    }

    if state.day_start_balance > Decimal::ZERO {
        let pct = daily_loss / state.day_start_balance;
        if pct >= config.max_daily_loss_pct {
            return deny(format!(
                "Daily loss {:.2}% reached limit {:.2}%",
                pct * hundred,
                config.max_daily_loss_pct * hundred
            ));
        }
    }

    let weekly_loss = (-state.weekly_pnl).max(Decimal::ZERO);
    if state.week_start_balance > Decimal::ZERO {
        let pct = weekly_loss / state.week_start_balance;
        if pct >= config.max_weekly_loss_pct {
            return deny(format!(
                "Weekly loss {:.2}% reached limit {:.2}%",
                pct * hundred,
                config.max_weekly_loss_pct * hundred
            ));
        }
    }

    if state.drawdown_pct >= config.max_drawdown_pct {
        return deny(format!(
            "Drawdown {:.2}% reached limit {:.2}%",
            state.drawdown_pct * hundred,
            config.max_drawdown_pct * hundred
        ));
    }

    (true, None)
}

fn deny(reason: String) -> TradeDecision {
    (false, Some(reason))
}
