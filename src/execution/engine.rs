//! Fail-closed execution gate.
//!
//! Entries pass a fixed sequence of checks and nothing is persisted unless
//! every one of them holds. Exits reuse the order confirmation but are never
//! blocked by the kill switch.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::error::{ExecutionError, Result};
use super::fill::{confirm_order, ConfirmedFill};
use super::kill_switch::KillSwitch;
use super::profit_taking::ProfitLadder;
use crate::broker::Broker;
use crate::db::TradeLedger;
use crate::models::{OrderSide, Position, TradeKind, TradeRecord};

/// Execution gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Max unfavourable entry slippage before the fill is unwound
    pub max_slippage: Decimal,

    /// Stop-loss distance from entry
    pub stop_loss_pct: Decimal,

    /// Take-profit distance from entry
    pub take_profit_pct: Decimal,

    /// Per-fill fee estimate recorded in the ledger
    pub fee_rate: Decimal,

    /// Stepped profit-taking ladder
    pub ladder: ProfitLadder,

    /// Delay before the single forced-exit retry
    pub force_exit_retry_ms: u64,

    /// Sentinel file that halts new entries while it exists
    pub kill_file: Option<PathBuf>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_slippage: dec!(0.005),    // 0.5%
            stop_loss_pct: dec!(0.02),    // 2%
            take_profit_pct: dec!(0.05),  // 5%
            fee_rate: dec!(0.007),        // 0.7% per side
            ladder: ProfitLadder::default(),
            force_exit_retry_ms: 1000,
            kill_file: None,
        }
    }
}

/// Outcome of a successful (partial) exit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExitReport {
    pub user_id: String,
    pub symbol: String,
    pub order_id: String,
    pub quantity: Decimal,
    pub price: Decimal,
    pub realized_pnl: Decimal,
    /// Fee on this exit fill
    pub fee: Decimal,
    /// Share of the entry fee carried by the exited quantity
    pub entry_fee: Decimal,
    /// Fraction of the original size still open
    pub remaining_size: Decimal,
    pub closed: bool,
    pub reason: String,
}

impl ExitReport {
    /// Realized PnL after both the exit fee and the exited share of the
    /// entry fee.
    pub fn net_pnl(&self) -> Decimal {
        self.realized_pnl - self.fee - self.entry_fee
    }
}

type PositionKey = (String, String);

fn key(user_id: &str, symbol: &str) -> PositionKey {
    (user_id.to_string(), symbol.to_string())
}

/// Signed slippage, positive when the fill is worse than expected.
pub fn unfavorable_slippage(side: OrderSide, expected: Decimal, actual: Decimal) -> Decimal {
    if expected.is_zero() {
        return Decimal::ZERO;
    }
    match side {
        OrderSide::Buy => (actual - expected) / expected,
        OrderSide::Sell => (expected - actual) / expected,
    }
}

/// Exactly one retry after a fixed delay.
struct OneShotBackoff {
    delay: Duration,
    used: bool,
}

impl Backoff for OneShotBackoff {
    fn next_backoff(&mut self) -> Option<Duration> {
        if self.used {
            None
        } else {
            self.used = true;
            Some(self.delay)
        }
    }

    fn reset(&mut self) {
        self.used = false;
    }
}

/// Order execution with safety checks and position tracking.
///
/// The position map's write lock is held across each broker round trip, so
/// entries and exits are serialized engine-wide. That keeps the duplicate
/// entry check and the remaining-size update atomic with the order they
/// guard; readers wait for the order in flight.
pub struct ExecutionEngine {
    config: ExecutionConfig,
    broker: Arc<dyn Broker>,
    ledger: Arc<dyn TradeLedger>,
    kill_switch: Arc<KillSwitch>,
    positions: RwLock<HashMap<PositionKey, Position>>,
}

impl ExecutionEngine {
    pub fn new(
        config: ExecutionConfig,
        broker: Arc<dyn Broker>,
        ledger: Arc<dyn TradeLedger>,
    ) -> Self {
        let kill_switch = match &config.kill_file {
            Some(path) => KillSwitch::with_sentinel(path),
            None => KillSwitch::new(),
        };
        Self {
            config,
            broker,
            ledger,
            kill_switch: Arc::new(kill_switch),
            positions: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn kill_switch(&self) -> &Arc<KillSwitch> {
        &self.kill_switch
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Load open positions from the ledger, e.g. after a restart.
    pub async fn restore_positions(&self) -> anyhow::Result<usize> {
        let stored = self.ledger.get_open_positions(None).await?;
        let mut positions = self.positions.write().await;
        for mut pos in stored {
            // Ladder may have changed since the position was opened
            pos.ladder_hits.resize(self.config.ladder.len(), false);
            positions.insert(key(&pos.user_id, &pos.symbol), pos);
        }
        info!(count = positions.len(), "Restored open positions");
        Ok(positions.len())
    }

    pub async fn get_position(&self, user_id: &str, symbol: &str) -> Option<Position> {
        self.positions.read().await.get(&key(user_id, symbol)).cloned()
    }

    pub async fn open_positions(&self, user_id: &str) -> Vec<Position> {
        self.positions
            .read()
            .await
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect()
    }

    pub async fn open_position_count(&self, user_id: &str) -> usize {
        self.positions
            .read()
            .await
            .values()
            .filter(|p| p.user_id == user_id)
            .count()
    }

    /// Open a position worth `size_usd` at roughly `expected_price`.
    pub async fn execute_entry(
        &self,
        user_id: &str,
        symbol: &str,
        side: OrderSide,
        size_usd: Decimal,
        expected_price: Decimal,
    ) -> Result<Position> {
        // 1. Kill switch
        if let Some(reason) = self.kill_switch.check(user_id) {
            warn!(user_id = %user_id, symbol = %symbol, reason = %reason, "Entry blocked by kill switch");
            return Err(ExecutionError::KillSwitchActive { reason });
        }

        // 2. Symbol support
        if !self.broker.supports_symbol(symbol) {
            warn!(symbol = %symbol, broker = %self.broker.name(), "Unsupported symbol");
            return Err(ExecutionError::UnsupportedSymbol {
                symbol: symbol.to_string(),
                broker: self.broker.name().to_string(),
            });
        }

        if expected_price <= Decimal::ZERO || size_usd <= Decimal::ZERO {
            return Err(ExecutionError::rejected(format!(
                "invalid order request: size ${} at {}",
                size_usd, expected_price
            )));
        }

        let mut positions = self.positions.write().await;
        let pos_key = key(user_id, symbol);
        if positions.contains_key(&pos_key) {
            return Err(ExecutionError::rejected(format!(
                "position already open for {}",
                symbol
            )));
        }

        // 3. Place order
        let quantity = (size_usd / expected_price).round_dp(8);
        info!(
            user_id = %user_id,
            symbol = %symbol,
            side = %side,
            size_usd = %size_usd,
            quantity = %quantity,
            expected_price = %expected_price,
            "Placing entry order"
        );
        let response = self
            .broker
            .place_market_order(symbol, side, quantity)
            .await
            .map_err(|e| {
                error!(symbol = %symbol, error = %e, "Broker unreachable");
                ExecutionError::Broker(e)
            })?;

        // 4-7. Status, id, whitelist, symbol and fill price
        let fill = confirm_order(&response, symbol, quantity).inspect_err(|e| {
            warn!(symbol = %symbol, kind = e.kind(), error = %e, "Entry order not confirmed");
        })?;

        // 8. Slippage
        let slippage = unfavorable_slippage(side, expected_price, fill.price);
        if slippage > self.config.max_slippage {
            error!(
                symbol = %symbol,
                expected = %expected_price,
                actual = %fill.price,
                slippage = %slippage,
                "Slippage above limit, closing immediately"
            );
            self.unwind(symbol, side, &fill).await;
            return Err(ExecutionError::ImmediateLoss {
                expected: expected_price,
                actual: fill.price,
                slippage,
                max_slippage: self.config.max_slippage,
            });
        }

        // 9. Persist and track
        let (stop_loss, take_profit) = self.levels(side, fill.price);
        let position = Position::new(
            user_id.to_string(),
            symbol.to_string(),
            side,
            fill.price,
            fill.quantity,
            stop_loss,
            take_profit,
            self.config.ladder.len(),
            fill.order_id.clone(),
        );

        let trade = self.trade_record(&position, side, TradeKind::Entry, &fill, Decimal::ZERO, "entry");

        // The broker holds the fill regardless, so track it even if the ledger fails
        positions.insert(pos_key, position.clone());
        drop(positions);

        self.record_fill(&trade).await?;
        self.ledger
            .open_position(&position)
            .await
            .map_err(ExecutionError::Ledger)?;

        info!(
            user_id = %user_id,
            symbol = %symbol,
            side = %side,
            order_id = %fill.order_id,
            price = %fill.price,
            quantity = %fill.quantity,
            stop_loss = %stop_loss,
            take_profit = %take_profit,
            "Entry confirmed"
        );

        Ok(position)
    }

    /// Exit `fraction` of the original position size.
    pub async fn execute_exit(
        &self,
        user_id: &str,
        symbol: &str,
        fraction: Decimal,
        reason: &str,
    ) -> Result<ExitReport> {
        self.exit_inner(user_id, symbol, fraction, reason, None).await
    }

    /// Fire every ladder level reached at `price` that has not fired yet.
    ///
    /// Each level sells its share of what is still open when it fires, so
    /// the ladder alone never closes a position.
    pub async fn check_stepped_profit(
        &self,
        user_id: &str,
        symbol: &str,
        price: Decimal,
    ) -> Result<Vec<ExitReport>> {
        let position = self.require_position(user_id, symbol).await?;
        let hits = self.config.ladder.pending_hits(&position, price);

        let mut reports = Vec::with_capacity(hits.len());
        for hit in hits {
            debug!(
                symbol = %symbol,
                level = hit.index,
                threshold = %hit.level.threshold,
                net_return = %hit.net_return,
                "Profit level reached"
            );
            let remaining = self.require_position(user_id, symbol).await?.remaining_size;
            let fraction = hit.level.tranche(remaining);
            if fraction <= Decimal::ZERO {
                continue;
            }
            let report = self
                .exit_inner(user_id, symbol, fraction, &hit.level.reason(), Some(hit.index))
                .await?;
            let closed = report.closed;
            reports.push(report);
            if closed {
                break;
            }
        }
        Ok(reports)
    }

    /// Stop-loss, then take-profit, then the profit ladder.
    pub async fn check_exit_conditions(
        &self,
        user_id: &str,
        symbol: &str,
        price: Decimal,
    ) -> Result<Vec<ExitReport>> {
        let position = self.require_position(user_id, symbol).await?;

        if position.stop_hit(price) {
            warn!(user_id = %user_id, symbol = %symbol, price = %price, stop = %position.stop_loss, "Stop loss hit");
            return self.force_exit(user_id, symbol, "stop_loss").await.map(|r| vec![r]);
        }

        if position.take_profit_hit(price) {
            info!(user_id = %user_id, symbol = %symbol, price = %price, "Take profit hit");
            return self
                .execute_exit(user_id, symbol, Decimal::ONE, "take_profit")
                .await
                .map(|r| vec![r]);
        }

        self.check_stepped_profit(user_id, symbol, price).await
    }

    /// Full exit with a single retry after a fixed delay.
    ///
    /// Transport failures and rejections are retried. Anything that may
    /// follow a fill (ledger errors, missing ids) is not, to avoid a double exit.
    pub async fn force_exit(&self, user_id: &str, symbol: &str, reason: &str) -> Result<ExitReport> {
        let backoff = OneShotBackoff {
            delay: Duration::from_millis(self.config.force_exit_retry_ms),
            used: false,
        };

        let this = self;
        let result = backoff::future::retry(backoff, move || async move {
            this.exit_inner(user_id, symbol, Decimal::ONE, reason, None)
                .await
                .map_err(|e| match e {
                    ExecutionError::Broker(_) | ExecutionError::OrderRejected { .. } => {
                        warn!(symbol = %symbol, error = %e, "Forced exit failed, will retry once");
                        backoff::Error::transient(e)
                    }
                    other => backoff::Error::permanent(other),
                })
        })
        .await;

        if let Err(e) = &result {
            error!(
                user_id = %user_id,
                symbol = %symbol,
                error = %e,
                "Forced exit failed, position left as last known"
            );
        }
        result
    }

    async fn exit_inner(
        &self,
        user_id: &str,
        symbol: &str,
        fraction: Decimal,
        reason: &str,
        ladder_index: Option<usize>,
    ) -> Result<ExitReport> {
        if fraction <= Decimal::ZERO || fraction > Decimal::ONE {
            return Err(ExecutionError::InvalidExitFraction(fraction));
        }

        let mut positions = self.positions.write().await;
        let pos_key = key(user_id, symbol);
        let position = positions
            .get(&pos_key)
            .ok_or_else(|| ExecutionError::PositionNotFound {
                user_id: user_id.to_string(),
                symbol: symbol.to_string(),
            })?;

        let quantity = position.exit_quantity(fraction).round_dp(8);
        let exit_side = position.side.opposite();

        let response = self
            .broker
            .place_market_order(symbol, exit_side, quantity)
            .await
            .map_err(ExecutionError::Broker)?;
        let fill = confirm_order(&response, symbol, quantity).inspect_err(|e| {
            warn!(symbol = %symbol, kind = e.kind(), error = %e, "Exit order not confirmed");
        })?;

        // Only mutate after the broker confirmed, and only by what filled
        let Some(position) = positions.get_mut(&pos_key) else {
            return Err(ExecutionError::PositionNotFound {
                user_id: user_id.to_string(),
                symbol: symbol.to_string(),
            });
        };
        let filled_fraction = if position.quantity > Decimal::ZERO {
            (fill.quantity / position.quantity).min(fraction)
        } else {
            fraction
        };
        if fill.quantity < quantity {
            warn!(
                symbol = %symbol,
                requested = %quantity,
                filled = %fill.quantity,
                "Exit partially filled"
            );
        }
        position.reduce(filled_fraction);
        if let Some(flag) = ladder_index.and_then(|i| position.ladder_hits.get_mut(i)) {
            *flag = true;
        }

        let realized_pnl = position.pnl_for(fill.quantity, fill.price);
        let entry_fee = (fill.quantity * position.entry_price * self.config.fee_rate).round_dp(8);
        let trade = self.trade_record(position, exit_side, TradeKind::Exit, &fill, realized_pnl, reason);
        let closed = position.is_closed();
        let remaining_size = position.remaining_size;
        let snapshot = position.clone();

        if closed {
            positions.remove(&pos_key);
        }
        drop(positions);

        self.record_fill(&trade).await?;
        if closed {
            self.ledger
                .close_position(user_id, symbol, fill.price)
                .await
                .map_err(ExecutionError::Ledger)?;
        } else {
            self.ledger
                .update_position_remaining(&snapshot)
                .await
                .map_err(ExecutionError::Ledger)?;
        }

        info!(
            user_id = %user_id,
            symbol = %symbol,
            reason = %reason,
            quantity = %fill.quantity,
            price = %fill.price,
            pnl = %realized_pnl,
            remaining = %remaining_size,
            closed,
            "Exit confirmed"
        );

        Ok(ExitReport {
            user_id: user_id.to_string(),
            symbol: symbol.to_string(),
            order_id: fill.order_id,
            quantity: fill.quantity,
            price: fill.price,
            realized_pnl,
            fee: trade.fee,
            entry_fee,
            remaining_size,
            closed,
            reason: reason.to_string(),
        })
    }

    /// Offsetting market order for a fill that slipped too far.
    async fn unwind(&self, symbol: &str, side: OrderSide, fill: &ConfirmedFill) {
        match self
            .broker
            .place_market_order(symbol, side.opposite(), fill.quantity)
            .await
        {
            Ok(resp) => match confirm_order(&resp, symbol, fill.quantity) {
                Ok(close) => info!(
                    symbol = %symbol,
                    order_id = %close.order_id,
                    price = %close.price,
                    "Slipped entry closed"
                ),
                Err(e) => error!(symbol = %symbol, error = %e, "Close of slipped entry not confirmed, manual action needed"),
            },
            Err(e) => error!(symbol = %symbol, error = %e, "Close of slipped entry failed, manual action needed"),
        }
    }

    async fn require_position(&self, user_id: &str, symbol: &str) -> Result<Position> {
        self.get_position(user_id, symbol)
            .await
            .ok_or_else(|| ExecutionError::PositionNotFound {
                user_id: user_id.to_string(),
                symbol: symbol.to_string(),
            })
    }

    fn levels(&self, side: OrderSide, price: Decimal) -> (Decimal, Decimal) {
        let sl = self.config.stop_loss_pct;
        let tp = self.config.take_profit_pct;
        match side {
            OrderSide::Buy => (price * (Decimal::ONE - sl), price * (Decimal::ONE + tp)),
            OrderSide::Sell => (price * (Decimal::ONE + sl), price * (Decimal::ONE - tp)),
        }
    }

    fn trade_record(
        &self,
        position: &Position,
        side: OrderSide,
        kind: TradeKind,
        fill: &ConfirmedFill,
        realized_pnl: Decimal,
        reason: &str,
    ) -> TradeRecord {
        TradeRecord {
            id: Uuid::new_v4().to_string(),
            user_id: position.user_id.clone(),
            symbol: position.symbol.clone(),
            side,
            kind,
            quantity: fill.quantity,
            price: fill.price,
            fee: (fill.quantity * fill.price * self.config.fee_rate).round_dp(8),
            order_id: fill.order_id.clone(),
            realized_pnl,
            reason: reason.to_string(),
            timestamp: Utc::now(),
        }
    }

    async fn record_fill(&self, trade: &TradeRecord) -> Result<()> {
        let result = match trade.side {
            OrderSide::Buy => self.ledger.record_buy(trade).await,
            OrderSide::Sell => self.ledger.record_sell(trade).await,
        };
        result.map_err(|e| {
            error!(trade_id = %trade.id, error = %e, "Failed to record fill");
            ExecutionError::Ledger(e)
        })
    }
}
