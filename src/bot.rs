//! Bot runner: main orchestration loop.
//!
//! Each tick, per symbol:
//! - Open position: check stop-loss, take-profit and the profit ladder
//! - Flat: score an entry, size it, gate it through the risk manager and
//!   send it to the execution gate
//!
//! Realized PnL from every exit is fed back into the risk manager.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::broker::MarketData;
use crate::db::Database;
use crate::execution::{ExecutionEngine, ExitReport};
use crate::metrics::MetricsCalculator;
use crate::models::{Candle, OrderSide, PerformanceMetrics};
use crate::risk::UserRiskManager;
use crate::signals::{IndicatorSet, ScoreResult, SignalScorer};
use crate::trading::PositionSizer;

/// Exit returns kept for Kelly sizing.
const RETURN_WINDOW: usize = 100;

/// Exits needed before sizing trusts the metrics.
const MIN_SIZING_OBSERVATIONS: usize = 10;

/// Bot configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    /// Account the bot trades for
    pub user_id: String,

    /// Symbols to watch
    pub symbols: Vec<String>,

    /// Polling interval (seconds)
    pub poll_interval_secs: u64,

    /// Candles fetched per symbol per tick
    pub candle_limit: usize,

    /// Also score short entries
    pub allow_short: bool,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            user_id: "default".to_string(),
            symbols: vec!["BTC-USD".to_string(), "ETH-USD".to_string()],
            poll_interval_secs: 60,
            candle_limit: 100,
            allow_short: false,
        }
    }
}

/// Counters for one bot session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BotStats {
    pub ticks: u64,
    pub signals_evaluated: u64,
    pub signals_allowed: u64,
    pub entries: u64,
    pub risk_rejections: u64,
    pub execution_failures: u64,
    pub exits: u64,
    pub realized_pnl: Decimal,
    pub fees: Decimal,
    pub open_positions: usize,
    pub balance: Decimal,
    pub circuit_breaker: bool,
}

impl std::fmt::Display for BotStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Bot Statistics ===")?;
        writeln!(f, "Ticks:           {}", self.ticks)?;
        writeln!(f, "Signals:         {} evaluated, {} allowed", self.signals_evaluated, self.signals_allowed)?;
        writeln!(f, "Entries:         {} (risk rejected: {}, failed: {})",
            self.entries, self.risk_rejections, self.execution_failures)?;
        writeln!(f, "Exits:           {}", self.exits)?;
        writeln!(f, "Realized P&L:    ${:.2}", self.realized_pnl)?;
        writeln!(f, "Fees:            ${:.2}", self.fees)?;
        writeln!(f, "Open Positions:  {}", self.open_positions)?;
        writeln!(f, "Balance:         ${:.2}", self.balance)?;
        writeln!(f, "Circuit Breaker: {}", if self.circuit_breaker { "TRIPPED" } else { "ok" })?;
        Ok(())
    }
}

/// Main bot runner.
pub struct Bot {
    config: BotConfig,
    scorer: SignalScorer,
    sizer: PositionSizer,
    engine: Arc<ExecutionEngine>,
    risk: Arc<UserRiskManager>,
    market: Arc<dyn MarketData>,
    db: Database,

    stats: BotStats,
    /// Per-exit returns on exit notional, oldest first
    exit_returns: VecDeque<f64>,

    shutdown: Arc<AtomicBool>,
}

impl Bot {
    pub fn new(
        config: BotConfig,
        scorer: SignalScorer,
        sizer: PositionSizer,
        engine: Arc<ExecutionEngine>,
        risk: Arc<UserRiskManager>,
        market: Arc<dyn MarketData>,
        db: Database,
    ) -> Self {
        Self {
            config,
            scorer,
            sizer,
            engine,
            risk,
            market,
            db,
            stats: BotStats::default(),
            exit_returns: VecDeque::with_capacity(RETURN_WINDOW),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Get shutdown signal for external control.
    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    /// Restore risk state and open positions, and seed the balance from the
    /// broker for a user seen for the first time.
    pub async fn initialize(&mut self) -> Result<()> {
        info!("Initializing bot...");

        let restored = self.risk.load(&self.db).await?;
        let positions = self.engine.restore_positions().await?;

        let user = self.config.user_id.clone();
        if self.risk.get_state(&user).is_none() {
            let balance = self.engine.broker().get_account_balance().await?;
            self.risk.update_balance(&user, balance);
            info!(user_id = %user, balance = %balance, "Seeded risk state from broker balance");
        }

        info!(
            user_id = %user,
            risk_states = restored,
            positions,
            symbols = ?self.config.symbols,
            "Bot initialized"
        );
        Ok(())
    }

    /// Main run loop.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            poll_interval = self.config.poll_interval_secs,
            symbols = self.config.symbols.len(),
            "Starting bot run loop"
        );

        let mut poll_interval = interval(Duration::from_secs(self.config.poll_interval_secs.max(1)));

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        });

        while !self.shutdown.load(Ordering::SeqCst) {
            poll_interval.tick().await;

            if let Err(e) = self.tick().await {
                error!(error = %e, "Error in bot tick");
            }
        }

        self.shutdown().await
    }

    /// Single iteration over every symbol.
    pub async fn tick(&mut self) -> Result<()> {
        debug!("Bot tick");
        self.stats.ticks += 1;

        for symbol in self.config.symbols.clone() {
            let candles = match self.market.get_candles(&symbol, self.config.candle_limit).await {
                Ok(candles) => candles,
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Failed to fetch candles");
                    continue;
                }
            };
            self.on_candles(&symbol, &candles).await;
        }

        self.risk.save(&self.db).await
    }

    /// Manage the open position on `symbol`, or look for an entry.
    pub async fn on_candles(&mut self, symbol: &str, candles: &[Candle]) {
        let [.., prev, last] = candles else {
            debug!(symbol = %symbol, count = candles.len(), "Not enough candles");
            return;
        };

        let user = self.config.user_id.clone();
        if self.engine.get_position(&user, symbol).await.is_some() {
            self.manage_exits(&user, symbol, last.close).await;
            return;
        }

        self.try_entry(&user, symbol, candles, prev, last).await;
    }

    async fn manage_exits(&mut self, user: &str, symbol: &str, price: Decimal) {
        match self.engine.check_exit_conditions(user, symbol, price).await {
            Ok(reports) => {
                for report in &reports {
                    self.record_exit(report);
                }
            }
            Err(e) => {
                self.stats.execution_failures += 1;
                warn!(symbol = %symbol, kind = e.kind(), error = %e, "Exit check failed");
            }
        }
    }

    /// Feed a confirmed exit into the risk manager and sizing history.
    ///
    /// The risk balance moves by PnL net of the exit fee and the exited
    /// share of the entry fee.
    fn record_exit(&mut self, report: &ExitReport) {
        let net = report.net_pnl();

        self.stats.exits += 1;
        self.stats.realized_pnl += report.realized_pnl;
        self.stats.fees += report.fee + report.entry_fee;

        let notional = report.quantity * report.price;
        if notional > Decimal::ZERO {
            if self.exit_returns.len() == RETURN_WINDOW {
                self.exit_returns.pop_front();
            }
            self.exit_returns
                .push_back((net / notional).to_f64().unwrap_or(0.0));
        }

        if self.risk.record_trade(&report.user_id, net) {
            warn!(
                user_id = %report.user_id,
                symbol = %report.symbol,
                pnl = %net,
                "Circuit breaker tripped, new entries halted until rollover or reset"
            );
        }
    }

    async fn try_entry(
        &mut self,
        user: &str,
        symbol: &str,
        candles: &[Candle],
        prev: &Candle,
        last: &Candle,
    ) {
        let indicators = IndicatorSet::from_candles(candles);
        self.stats.signals_evaluated += 1;

        let Some((side, signal)) = self.best_signal(prev, last, &indicators) else {
            return;
        };
        self.stats.signals_allowed += 1;

        let balance = self
            .risk
            .get_state(user)
            .map_or(Decimal::ZERO, |s| s.balance);
        let open = self.engine.open_positions(user).await;
        let exposure: Decimal = open.iter().map(|p| p.notional()).sum();

        let metrics = self.sizing_metrics();
        let size = self
            .sizer
            .calculate_size(balance, signal.score, metrics.as_ref(), exposure);
        if size <= Decimal::ZERO {
            debug!(symbol = %symbol, balance = %balance, exposure = %exposure, "Sized to zero, skipping");
            return;
        }

        let (allowed, reason) = self.risk.can_trade(user, size, open.len());
        if !allowed {
            self.stats.risk_rejections += 1;
            info!(
                symbol = %symbol,
                size = %size,
                reason = reason.as_deref().unwrap_or("unknown"),
                "Entry rejected by risk manager"
            );
            return;
        }

        info!(symbol = %symbol, side = %side, size = %size, signal = %signal.reason, "Entry signal");
        match self
            .engine
            .execute_entry(user, symbol, side, size, last.close)
            .await
        {
            Ok(_) => {
                self.stats.entries += 1;
                self.risk.record_entry(user);
            }
            Err(e) => {
                self.stats.execution_failures += 1;
                warn!(symbol = %symbol, kind = e.kind(), error = %e, "Entry failed");
            }
        }
    }

    /// Highest-scoring allowed side, longs winning ties.
    fn best_signal(
        &self,
        prev: &Candle,
        last: &Candle,
        indicators: &IndicatorSet,
    ) -> Option<(OrderSide, ScoreResult)> {
        let sides: &[OrderSide] = if self.config.allow_short {
            &[OrderSide::Buy, OrderSide::Sell]
        } else {
            &[OrderSide::Buy]
        };

        let mut best: Option<(OrderSide, ScoreResult)> = None;
        for side in sides {
            let result = self.scorer.score(*side, prev, last, indicators);
            debug!(side = %side, score = result.score, reason = %result.reason, "Signal scored");
            if !result.allowed {
                continue;
            }
            if best.as_ref().map_or(true, |(_, b)| result.score > b.score) {
                best = Some((*side, result));
            }
        }
        best
    }

    fn sizing_metrics(&self) -> Option<PerformanceMetrics> {
        if self.exit_returns.len() < MIN_SIZING_OBSERVATIONS {
            return None;
        }
        let returns: Vec<f64> = self.exit_returns.iter().copied().collect();
        Some(MetricsCalculator::calculate(&returns))
    }

    async fn shutdown(&self) -> Result<()> {
        info!("Shutting down bot...");
        self.risk.save(&self.db).await?;
        let stats = self.get_stats().await;
        info!(
            entries = stats.entries,
            exits = stats.exits,
            realized_pnl = %stats.realized_pnl,
            open_positions = stats.open_positions,
            "Bot stopped"
        );
        Ok(())
    }

    /// Get current bot statistics.
    pub async fn get_stats(&self) -> BotStats {
        let user = &self.config.user_id;
        let state = self.risk.get_state(user);

        BotStats {
            open_positions: self.engine.open_position_count(user).await,
            balance: state.as_ref().map_or(Decimal::ZERO, |s| s.balance),
            circuit_breaker: state.is_some_and(|s| s.circuit_breaker),
            ..self.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{PaperBroker, PaperBrokerConfig};
    use crate::execution::ExecutionConfig;
    use crate::risk::RiskConfig;
    use crate::signals::ScorerConfig;
    use crate::trading::SizingConfig;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use rust_decimal_macros::dec;
    use tokio::sync::RwLock;

    struct FixedMarket {
        candles: RwLock<Vec<Candle>>,
    }

    #[async_trait]
    impl MarketData for FixedMarket {
        async fn get_candles(&self, _symbol: &str, limit: usize) -> Result<Vec<Candle>> {
            let candles = self.candles.read().await;
            let start = candles.len().saturating_sub(limit);
            Ok(candles[start..].to_vec())
        }
    }

    fn candle(i: i64, close: Decimal) -> Candle {
        Candle::new(
            Utc::now() - ChronoDuration::hours(100 - i),
            close,
            close + dec!(1),
            close - dec!(1),
            close,
            dec!(10),
        )
    }

    async fn setup(min_score: u8) -> (Bot, Arc<PaperBroker>, Arc<FixedMarket>) {
        setup_with_fee(min_score, Decimal::ZERO).await
    }

    async fn setup_with_fee(
        min_score: u8,
        fee_rate: Decimal,
    ) -> (Bot, Arc<PaperBroker>, Arc<FixedMarket>) {
        let broker = Arc::new(PaperBroker::new(PaperBrokerConfig {
            initial_balance: dec!(10000),
            slippage_pct: Decimal::ZERO,
            fee_pct: Decimal::ZERO,
            symbols: vec!["BTC-USD".to_string()],
        }));
        let db = Database::in_memory().await.unwrap();
        let engine = Arc::new(ExecutionEngine::new(
            ExecutionConfig {
                fee_rate,
                force_exit_retry_ms: 0,
                ..Default::default()
            },
            broker.clone(),
            Arc::new(db.clone()),
        ));
        let risk = Arc::new(UserRiskManager::new(RiskConfig::default()));
        let market = Arc::new(FixedMarket {
            candles: RwLock::new((0..40).map(|i| candle(i, dec!(100))).collect()),
        });

        let mut bot = Bot::new(
            BotConfig {
                symbols: vec!["BTC-USD".to_string()],
                ..Default::default()
            },
            SignalScorer::new(ScorerConfig {
                min_signal_score: min_score,
                ..Default::default()
            }),
            PositionSizer::new(SizingConfig::default()),
            engine,
            risk,
            market.clone(),
            db,
        );
        broker.set_price("BTC-USD", dec!(100)).await;
        bot.initialize().await.unwrap();
        (bot, broker, market)
    }

    #[tokio::test]
    async fn test_initialize_seeds_balance() {
        let (bot, _, _) = setup(3).await;
        let stats = bot.get_stats().await;

        assert_eq!(stats.balance, dec!(10000));
        assert!(!stats.circuit_breaker);
    }

    #[tokio::test]
    async fn test_tick_enters_and_stop_loss_feeds_risk() {
        // Zero threshold: every candle is an allowed entry
        let (mut bot, broker, market) = setup(0).await;

        bot.tick().await.unwrap();
        let position = bot.engine().get_position("default", "BTC-USD").await.unwrap();
        // 5% of $10k
        assert_eq!(position.notional(), dec!(500));

        // Price collapses through the 2% stop
        broker.set_price("BTC-USD", dec!(90)).await;
        market.candles.write().await.push(candle(41, dec!(90)));
        bot.tick().await.unwrap();

        assert!(bot.engine().get_position("default", "BTC-USD").await.is_none());
        let stats = bot.get_stats().await;
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.exits, 1);
        assert_eq!(stats.realized_pnl, dec!(-50));
        assert_eq!(stats.balance, dec!(9950));
    }

    #[tokio::test]
    async fn test_risk_balance_carries_entry_and_exit_fees() {
        let (mut bot, broker, market) = setup_with_fee(0, dec!(0.01)).await;

        bot.tick().await.unwrap();
        let state = bot.risk.get_state("default").unwrap();
        assert_eq!(state.daily_trades, 1);

        broker.set_price("BTC-USD", dec!(90)).await;
        market.candles.write().await.push(candle(41, dec!(90)));
        bot.tick().await.unwrap();

        // -50 PnL, 4.50 exit fee (5 @ 90), 5.00 entry fee (5 @ 100)
        let stats = bot.get_stats().await;
        assert_eq!(stats.realized_pnl, dec!(-50));
        assert_eq!(stats.fees, dec!(9.5));
        assert_eq!(stats.balance, dec!(9940.5));

        // The exit did not count as another trade
        let state = bot.risk.get_state("default").unwrap();
        assert_eq!(state.daily_trades, 1);
    }

    #[tokio::test]
    async fn test_circuit_breaker_blocks_entries() {
        let (mut bot, _, _) = setup(0).await;
        bot.risk.trip_circuit_breaker("default", "manual halt");

        bot.tick().await.unwrap();

        let stats = bot.get_stats().await;
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.risk_rejections, 1);
        assert!(stats.circuit_breaker);
    }

    #[tokio::test]
    async fn test_kill_switch_counts_as_failure() {
        let (mut bot, _, _) = setup(0).await;
        bot.engine().kill_switch().engage_global("maintenance");

        bot.tick().await.unwrap();

        let stats = bot.get_stats().await;
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.execution_failures, 1);
    }
}
