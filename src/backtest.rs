//! Backtesting: replay historical candles through the bot with a paper
//! broker and an in-memory ledger.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{info, warn};

use crate::bot::{Bot, BotConfig, BotStats};
use crate::broker::{MarketData, PaperBroker, PaperBrokerConfig};
use crate::db::{Database, TradeLedger, TradeStatistics};
use crate::execution::{ExecutionConfig, ExecutionEngine};
use crate::models::Candle;
use crate::risk::{RiskConfig, UserRiskManager};
use crate::signals::{ScorerConfig, SignalScorer};
use crate::trading::{PositionSizer, SizingConfig};

/// Backtest configuration.
#[derive(Debug, Clone)]
pub struct BacktestConfig {
    pub symbol: String,

    /// Initial capital for simulation
    pub initial_capital: Decimal,

    /// Simulated slippage (0.001 = 0.1%)
    pub slippage: Decimal,

    /// Simulated fee rate per fill
    pub fee_rate: Decimal,

    /// Candles fed to the bot before it may trade
    pub warmup: usize,

    pub scorer: ScorerConfig,
    pub execution: ExecutionConfig,
    pub risk: RiskConfig,
    pub sizing: SizingConfig,
    pub bot: BotConfig,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            symbol: "BTC-USD".to_string(),
            initial_capital: dec!(10000),
            slippage: dec!(0.0005),
            fee_rate: dec!(0.007),
            warmup: 50,
            scorer: ScorerConfig::default(),
            execution: ExecutionConfig::default(),
            risk: RiskConfig::default(),
            sizing: SizingConfig::default(),
            bot: BotConfig::default(),
        }
    }
}

/// Results of a backtest run.
#[derive(Debug, Clone)]
pub struct BacktestResults {
    pub symbol: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub candles: usize,

    pub initial_capital: Decimal,
    pub final_capital: Decimal,
    pub total_return_pct: Decimal,
    pub total_fees: Decimal,

    /// Ledger view of the run
    pub ledger: TradeStatistics,

    /// Bot counters
    pub bot: BotStats,

    /// Peak-to-trough drop of marked equity (0.0 to 1.0)
    pub max_drawdown_pct: f64,
}

impl std::fmt::Display for BacktestResults {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n{:=^60}", " BACKTEST RESULTS ")?;
        writeln!(f)?;
        writeln!(f, "Symbol: {} ({} candles)", self.symbol, self.candles)?;
        writeln!(f, "Period: {} to {}",
            self.start_time.format("%Y-%m-%d %H:%M"),
            self.end_time.format("%Y-%m-%d %H:%M"))?;
        writeln!(f)?;
        writeln!(f, "--- Capital ---")?;
        writeln!(f, "Initial:     ${:.2}", self.initial_capital)?;
        writeln!(f, "Final:       ${:.2}", self.final_capital)?;
        writeln!(f, "Return:      {:.2}%", self.total_return_pct * dec!(100))?;
        writeln!(f, "Fees Paid:   ${:.2}", self.total_fees)?;
        writeln!(f)?;
        writeln!(f, "--- Trades ---")?;
        writeln!(f, "Entries:     {} ({} risk rejected, {} failed)",
            self.bot.entries, self.bot.risk_rejections, self.bot.execution_failures)?;
        writeln!(f, "Exits:       {}", self.ledger.exits)?;
        writeln!(f, "Winners:     {} ({:.1}%)", self.ledger.winning_exits, self.ledger.win_rate() * 100.0)?;
        writeln!(f, "Losers:      {}", self.ledger.losing_exits)?;
        writeln!(f, "Realized:    ${:.2}", self.ledger.realized_pnl)?;
        writeln!(f)?;
        writeln!(f, "--- Risk Metrics ---")?;
        writeln!(f, "Max Drawdown: {:.2}%", self.max_drawdown_pct * 100.0)?;
        writeln!(f, "Breaker:      {}", if self.bot.circuit_breaker { "TRIPPED" } else { "ok" })?;
        writeln!(f, "{:=^60}", "")?;
        Ok(())
    }
}

/// Market data that reveals a candle series one bar at a time.
struct ReplayFeed {
    candles: Vec<Candle>,
    cursor: AtomicUsize,
}

impl ReplayFeed {
    fn new(candles: Vec<Candle>) -> Self {
        Self {
            candles,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Make the first `n` candles visible.
    fn advance_to(&self, n: usize) {
        self.cursor.store(n.min(self.candles.len()), Ordering::SeqCst);
    }
}

#[async_trait]
impl MarketData for ReplayFeed {
    async fn get_candles(&self, _symbol: &str, limit: usize) -> Result<Vec<Candle>> {
        let end = self.cursor.load(Ordering::SeqCst);
        let start = end.saturating_sub(limit);
        Ok(self.candles[start..end].to_vec())
    }
}

/// Load candles from a JSON array file, sorted oldest first.
pub fn load_candles(path: &Path) -> Result<Vec<Candle>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read candle file {}", path.display()))?;
    let mut candles: Vec<Candle> =
        serde_json::from_str(&raw).context("Failed to parse candle file")?;
    candles.sort_by_key(|c| c.timestamp);
    Ok(candles)
}

/// Backtesting engine.
pub struct Backtester {
    config: BacktestConfig,
}

impl Backtester {
    pub fn new(config: BacktestConfig) -> Self {
        Self { config }
    }

    /// Replay `candles` and close whatever is still open at the last close.
    pub async fn run(&self, candles: Vec<Candle>) -> Result<BacktestResults> {
        let cfg = &self.config;
        if candles.len() <= cfg.warmup.max(2) {
            bail!(
                "Need more than {} candles for a backtest, got {}",
                cfg.warmup.max(2),
                candles.len()
            );
        }

        let (start_time, end_time) = match (candles.first(), candles.last()) {
            (Some(first), Some(last)) => (first.timestamp, last.timestamp),
            _ => bail!("Empty candle series"),
        };
        let count = candles.len();
        let closes: Vec<Decimal> = candles.iter().map(|c| c.close).collect();

        let broker = Arc::new(PaperBroker::new(PaperBrokerConfig {
            initial_balance: cfg.initial_capital,
            slippage_pct: cfg.slippage,
            fee_pct: cfg.fee_rate,
            symbols: vec![cfg.symbol.clone()],
        }));
        let db = Database::in_memory().await?;
        let engine = Arc::new(ExecutionEngine::new(
            ExecutionConfig {
                fee_rate: cfg.fee_rate,
                force_exit_retry_ms: 0,
                kill_file: None,
                ..cfg.execution.clone()
            },
            broker.clone(),
            Arc::new(db.clone()),
        ));
        let risk = Arc::new(UserRiskManager::new(cfg.risk.clone()));
        let feed = Arc::new(ReplayFeed::new(candles));

        let bot_config = BotConfig {
            symbols: vec![cfg.symbol.clone()],
            ..cfg.bot.clone()
        };
        let user = bot_config.user_id.clone();

        let mut bot = Bot::new(
            bot_config,
            SignalScorer::from_config(cfg.scorer.clone()),
            PositionSizer::new(cfg.sizing.clone()),
            engine.clone(),
            risk,
            feed.clone(),
            db.clone(),
        );
        bot.initialize().await?;

        info!(
            symbol = %cfg.symbol,
            candles = count,
            warmup = cfg.warmup,
            capital = %cfg.initial_capital,
            "Starting backtest"
        );

        let mut peak = cfg.initial_capital;
        let mut max_drawdown = 0.0f64;

        for (i, close) in closes.iter().enumerate().skip(cfg.warmup) {
            broker.set_price(&cfg.symbol, *close).await;
            feed.advance_to(i + 1);
            bot.tick().await?;

            let equity = broker.equity().await;
            if equity > peak {
                peak = equity;
            }
            if peak > Decimal::ZERO {
                let dd = ((peak - equity) / peak).to_f64().unwrap_or(0.0);
                max_drawdown = max_drawdown.max(dd);
            }
        }

        if engine.get_position(&user, &cfg.symbol).await.is_some() {
            if let Err(e) = engine
                .execute_exit(&user, &cfg.symbol, Decimal::ONE, "backtest_end")
                .await
            {
                warn!(error = %e, "Failed to close final position");
            }
        }

        let final_capital = broker.equity().await;
        let ledger = db.get_statistics(Some(&user)).await?;

        Ok(BacktestResults {
            symbol: cfg.symbol.clone(),
            start_time,
            end_time,
            candles: count,
            initial_capital: cfg.initial_capital,
            final_capital,
            total_return_pct: return_pct(cfg.initial_capital, final_capital),
            total_fees: broker.fees_paid().await,
            ledger,
            bot: bot.get_stats().await,
            max_drawdown_pct: max_drawdown,
        })
    }
}

/// Total return of `equity` over `initial`, as a fraction.
fn return_pct(initial: Decimal, equity: Decimal) -> Decimal {
    if initial <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    ((equity - initial) / initial).round_dp(6)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn series(closes: &[Decimal]) -> Vec<Candle> {
        let start = Utc::now() - Duration::hours(closes.len() as i64);
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| {
                Candle::new(
                    start + Duration::hours(i as i64),
                    *c,
                    *c + dec!(0.5),
                    *c - dec!(0.5),
                    *c,
                    dec!(100),
                )
            })
            .collect()
    }

    fn always_enter() -> BacktestConfig {
        BacktestConfig {
            warmup: 5,
            slippage: Decimal::ZERO,
            fee_rate: Decimal::ZERO,
            scorer: ScorerConfig {
                min_signal_score: 0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_rejects_short_series() {
        let backtester = Backtester::new(BacktestConfig::default());
        let err = backtester.run(series(&[dec!(100); 10])).await.unwrap_err();
        assert!(err.to_string().contains("Need more than"));
    }

    #[tokio::test]
    async fn test_take_profit_round_trip() {
        // Enter at 100, then jump past the 5% take-profit
        let mut closes = vec![dec!(100); 7];
        closes.push(dec!(106));
        closes.push(dec!(106));

        let results = Backtester::new(always_enter())
            .run(series(&closes))
            .await
            .unwrap();

        assert!(results.bot.entries >= 1);
        assert!(results.ledger.winning_exits >= 1);
        assert!(results.final_capital > results.initial_capital);
        assert!(results.total_return_pct > Decimal::ZERO);
        assert_eq!(results.candles, 9);
    }

    #[tokio::test]
    async fn test_open_position_closed_at_end() {
        let closes = vec![dec!(100); 8];

        let results = Backtester::new(always_enter())
            .run(series(&closes))
            .await
            .unwrap();

        assert_eq!(results.bot.entries, 1);
        assert_eq!(results.ledger.open_positions, 0);
        assert_eq!(results.final_capital, results.initial_capital);
        assert_eq!(results.max_drawdown_pct, 0.0);
    }

    #[test]
    fn test_return_pct() {
        assert_eq!(return_pct(dec!(1000), dec!(1100)), dec!(0.1));
        assert_eq!(return_pct(Decimal::ZERO, dec!(1100)), Decimal::ZERO);
    }

    #[test]
    fn test_load_candles_sorts_by_time() {
        let mut candles = series(&[dec!(1), dec!(2), dec!(3)]);
        candles.reverse();
        let path = std::env::temp_dir().join(format!("candles-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, serde_json::to_string(&candles).unwrap()).unwrap();

        let loaded = load_candles(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[0].close, dec!(1));
        assert_eq!(loaded[2].close, dec!(3));
    }
}
