//! Crypto trading bot core.
//!
//! Scores entries from candle indicators, executes them through a
//! fail-closed safety gate, enforces per-user risk limits with a daily-loss
//! circuit breaker, and splits capital across strategies, brokers or assets.

mod allocation;
mod backtest;
mod bot;
mod broker;
mod config;
mod db;
mod execution;
mod metrics;
mod models;
mod risk;
mod signals;
mod trading;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::allocation::CapitalAllocationEngine;
use crate::backtest::{load_candles, BacktestConfig, Backtester};
use crate::bot::Bot;
use crate::broker::{Broker, MarketData, PaperBroker, PaperFeed, RestBroker};
use crate::config::AppConfig;
use crate::db::{Database, TradeLedger};
use crate::execution::{ExecutionEngine, KillSwitch};
use crate::models::{AllocationMethod, AllocationPlan, AllocationTarget, OrderSide, TargetType};
use crate::risk::{UserRiskManager, UserRiskState};
use crate::signals::{IndicatorSet, SignalScorer};
use crate::trading::PositionSizer;

/// Sentinel file used by `halt` / `resume` when none is configured.
const DEFAULT_KILL_FILE: &str = "cryptotrader.halt";

/// Crypto trading bot CLI.
#[derive(Parser)]
#[command(name = "cryptotrader")]
#[command(about = "Signal scoring, safe execution, risk limits and capital allocation for crypto trading", long_about = None)]
struct Cli {
    /// Configuration file (defaults to ./cryptotrader.toml if present)
    #[arg(short, long, env = "CRYPTOTRADER_CONFIG")]
    config: Option<PathBuf>,

    /// Database URL, overrides the configured one
    #[arg(short, long, env = "DATABASE_URL")]
    database: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Score the latest candle of a JSON candle file
    Score {
        /// JSON array of candles, oldest first
        #[arg(long)]
        candles: PathBuf,

        /// Entry side to score (buy/long or sell/short)
        #[arg(short, long, default_value = "buy")]
        side: String,
    },

    /// Build a capital allocation plan from a JSON list of targets
    Allocate {
        /// JSON array of allocation targets
        #[arg(long)]
        targets: PathBuf,

        /// Method (equal, sharpe, risk_parity, kelly)
        #[arg(short, long)]
        method: Option<String>,

        /// Only allocate to targets of this type (strategy, broker, asset)
        #[arg(short = 't', long = "type")]
        target_type: Option<String>,

        /// Total capital, overrides the configured one
        #[arg(long)]
        capital: Option<f64>,

        /// Persist the plan to the database
        #[arg(long)]
        save: bool,
    },

    /// Inspect or reset per-user risk state
    Risk {
        #[command(subcommand)]
        action: RiskAction,
    },

    /// Halt new entries (globally via the kill file, or for one user)
    Halt {
        /// Halt only this user
        #[arg(short, long)]
        user: Option<String>,

        /// Reason recorded with the halt
        #[arg(short, long, default_value = "manual halt")]
        reason: String,
    },

    /// Resume entries after a halt
    Resume {
        /// Resume only this user (resets their circuit breaker)
        #[arg(short, long)]
        user: Option<String>,
    },

    /// Replay a JSON candle file through the bot
    Backtest {
        /// JSON array of candles
        #[arg(long)]
        candles: PathBuf,

        /// Symbol the candles belong to
        #[arg(short, long, default_value = "BTC-USD")]
        symbol: String,

        /// Initial capital for simulation
        #[arg(short, long, default_value = "10000")]
        capital: f64,

        /// Simulated slippage percentage (0-100)
        #[arg(long, default_value = "0.05")]
        slippage: f64,

        /// Simulated fee percentage (0-100)
        #[arg(long, default_value = "0.7")]
        fee: f64,

        /// Candles before the first trade
        #[arg(long, default_value = "50")]
        warmup: usize,
    },

    /// Start the trading bot
    Run {
        /// Paper-trade against live candles instead of routing orders
        #[arg(long)]
        dry_run: bool,
    },

    /// Show ledger statistics and open positions
    Stats {
        /// Only this user
        #[arg(short, long)]
        user: Option<String>,
    },

    /// Show the effective configuration
    Config,
}

#[derive(Subcommand)]
enum RiskAction {
    /// Show risk state for one or all users
    Show {
        #[arg(short, long)]
        user: Option<String>,
    },
    /// Clear a user's circuit breaker
    Reset {
        #[arg(short, long)]
        user: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging; RUST_LOG wins over --log-level
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" | "debug" | "warn" | "error" => cli.log_level.to_lowercase(),
        _ => "info".to_string(),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = AppConfig::load(cli.config.as_deref())?;
    if let Some(url) = cli.database {
        config.database_url = url;
    }
    let kill_file = config
        .execution
        .kill_file
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_KILL_FILE));
    config.execution.kill_file = Some(kill_file.clone());

    match cli.command {
        Commands::Score { candles, side } => {
            let side = OrderSide::parse(&side)
                .with_context(|| format!("Invalid side: {}", side))?;
            let candles = load_candles(&candles)?;
            let [.., prev, last] = candles.as_slice() else {
                bail!("Need at least two candles, got {}", candles.len());
            };

            let indicators = IndicatorSet::from_candles(&candles);
            let scorer = SignalScorer::from_config(config.scorer.clone());
            let result = scorer.score(side, prev, last, &indicators);

            println!("\n=== Signal Score ===");
            println!("Candle:   {}", last.timestamp.format("%Y-%m-%d %H:%M"));
            println!("Close:    {}", last.close);
            println!("Side:     {}", side);
            println!("Score:    {}/{}", result.score, signals::MAX_SCORE);
            println!("Allowed:  {}", if result.allowed { "Yes" } else { "No" });
            println!("Reason:   {}", result.reason);
        }

        Commands::Allocate {
            targets,
            method,
            target_type,
            capital,
            save,
        } => {
            let method = match method {
                Some(m) => AllocationMethod::from_str(&m)
                    .with_context(|| format!("Unknown allocation method: {}", m))?,
                None => config.allocation.default_method,
            };
            let filter = target_type
                .map(|t| parse_target_type(&t))
                .transpose()?;

            let mut engine = CapitalAllocationEngine::new(config.allocation.clone());
            if let Some(capital) = capital {
                engine.set_total_capital(Decimal::try_from(capital)?);
            }

            for mut target in load_targets(&targets)? {
                let returns: Vec<f64> = std::mem::take(&mut target.returns_history).into();
                let id = target.id.clone();
                engine.add_target(target)?;
                if !returns.is_empty() {
                    engine.update_performance(&id, &returns)?;
                }
            }

            let plan = engine.create_allocation_plan(method, filter)?;
            print_plan(&plan);

            if save {
                let db = Database::new(&config.database_url).await?;
                let id = db.save_allocation_plan(&plan).await?;
                println!("\nSaved plan #{}", id);
            }
        }

        Commands::Risk { action } => {
            let db = Database::new(&config.database_url).await?;
            let risk = UserRiskManager::new(config.risk.clone());
            risk.load(&db).await?;

            match action {
                RiskAction::Show { user } => {
                    let users = match user {
                        Some(u) => vec![u],
                        None => risk.users(),
                    };
                    if users.is_empty() {
                        println!("No risk state recorded yet.");
                        return Ok(());
                    }
                    for user in users {
                        match risk.get_state(&user) {
                            Some(state) => print_risk_state(&state),
                            None => println!("\nNo risk state for {}", user),
                        }
                    }
                }
                RiskAction::Reset { user } => {
                    if risk.reset_circuit_breaker(&user) {
                        risk.save(&db).await?;
                        println!("Circuit breaker reset for {}", user);
                    } else {
                        println!("No tripped circuit breaker for {}", user);
                    }
                }
            }
        }

        Commands::Halt { user, reason } => match user {
            Some(user) => {
                let db = Database::new(&config.database_url).await?;
                let risk = UserRiskManager::new(config.risk.clone());
                risk.load(&db).await?;
                if risk.get_state(&user).is_none() {
                    bail!("No risk state for {}; it is created on the user's first run", user);
                }
                risk.trip_circuit_breaker(&user, &reason);
                risk.save(&db).await?;
                println!("Entries halted for {}: {}", user, reason);
            }
            None => {
                KillSwitch::with_sentinel(&kill_file).write_sentinel(&reason)?;
                println!("Global halt engaged ({})", kill_file.display());
            }
        },

        Commands::Resume { user } => match user {
            Some(user) => {
                let db = Database::new(&config.database_url).await?;
                let risk = UserRiskManager::new(config.risk.clone());
                risk.load(&db).await?;
                if risk.reset_circuit_breaker(&user) {
                    risk.save(&db).await?;
                    println!("Entries resumed for {}", user);
                } else {
                    println!("{} was not halted", user);
                }
            }
            None => {
                if KillSwitch::with_sentinel(&kill_file).clear_sentinel()? {
                    println!("Global halt released");
                } else {
                    println!("No global halt was engaged");
                }
            }
        },

        Commands::Backtest {
            candles,
            symbol,
            capital,
            slippage,
            fee,
            warmup,
        } => {
            info!(
                symbol = %symbol,
                capital = capital,
                slippage = slippage,
                fee = fee,
                "Starting backtest"
            );

            let series = load_candles(&candles)?;

            println!("\n=== Backtest ===");
            println!("File:     {}", candles.display());
            println!("Symbol:   {}", symbol);
            println!("Candles:  {}", series.len());
            println!("Capital:  ${}", capital);
            println!("Slippage: {}%", slippage);
            println!("Fee:      {}%", fee);

            let backtest_config = BacktestConfig {
                symbol,
                initial_capital: Decimal::try_from(capital)?,
                slippage: Decimal::try_from(slippage / 100.0)?,
                fee_rate: Decimal::try_from(fee / 100.0)?,
                warmup,
                scorer: config.scorer.clone(),
                execution: config.execution.clone(),
                risk: config.risk.clone(),
                sizing: config.sizing.clone(),
                bot: config.bot.clone(),
            };

            let results = Backtester::new(backtest_config).run(series).await?;
            println!("{}", results);
        }

        Commands::Run { dry_run } => {
            let db = Database::new(&config.database_url).await?;
            let rest = Arc::new(RestBroker::new(config.rest.clone())?);

            let (broker, market): (Arc<dyn Broker>, Arc<dyn MarketData>) = if dry_run {
                let paper = Arc::new(PaperBroker::new(config.paper.clone()));
                let feed: Arc<dyn MarketData> = Arc::new(PaperFeed::new(rest, paper.clone()));
                (paper as Arc<dyn Broker>, feed)
            } else {
                (rest.clone() as Arc<dyn Broker>, rest as Arc<dyn MarketData>)
            };

            let engine = Arc::new(ExecutionEngine::new(
                config.execution.clone(),
                broker,
                Arc::new(db.clone()),
            ));
            let risk = Arc::new(UserRiskManager::new(config.risk.clone()));

            let mut bot = Bot::new(
                config.bot.clone(),
                SignalScorer::from_config(config.scorer.clone()),
                PositionSizer::new(config.sizing.clone()),
                engine,
                risk,
                market,
                db,
            );
            bot.initialize().await?;

            println!("\n=== Crypto Trading Bot ===");
            println!("User:             {}", config.bot.user_id);
            println!("Symbols:          {}", config.bot.symbols.join(", "));
            println!("Polling interval: {}s", config.bot.poll_interval_secs);
            println!("Mode: {}", if dry_run { "DRY RUN (paper fills)" } else { "LIVE TRADING" });
            println!("Kill file:        {}", kill_file.display());
            println!("\nPress Ctrl+C to stop.\n");

            if let Err(e) = bot.run().await {
                tracing::error!(error = %e, "Bot error");
            }

            let stats = bot.get_stats().await;
            println!("\n{}", stats);
        }

        Commands::Stats { user } => {
            let db = Database::new(&config.database_url).await?;
            let stats = db.get_statistics(user.as_deref()).await?;
            let positions = db.get_open_positions(user.as_deref()).await?;

            println!("\n=== Ledger ===");
            println!("{}", stats);

            if !positions.is_empty() {
                println!("\n=== Open Positions ===");
                println!(
                    "{:<12} {:<12} {:<5} {:>14} {:>14} {:>10}",
                    "USER", "SYMBOL", "SIDE", "ENTRY", "QUANTITY", "REMAINING"
                );
                println!("{}", "-".repeat(72));
                for pos in &positions {
                    println!(
                        "{:<12} {:<12} {:<5} {:>14.4} {:>14.6} {:>9.1}%",
                        truncate(&pos.user_id, 12),
                        pos.symbol,
                        pos.side,
                        pos.entry_price,
                        pos.quantity,
                        pos.remaining_size * dec!(100)
                    );
                }
            }

            let plans = db.get_allocation_plans(1).await?;
            if let Some(plan) = plans.first() {
                println!("\n=== Latest Allocation Plan ===");
                print_plan(plan);
            }
        }

        Commands::Config => {
            let json = serde_json::to_string_pretty(&config.redacted())?;
            println!("{}", json);
        }
    }

    Ok(())
}

fn parse_target_type(s: &str) -> Result<TargetType> {
    match s.to_lowercase().as_str() {
        "strategy" => Ok(TargetType::Strategy),
        "broker" => Ok(TargetType::Broker),
        "asset" => Ok(TargetType::Asset),
        other => bail!("Unknown target type: {}", other),
    }
}

fn load_targets(path: &Path) -> Result<Vec<AllocationTarget>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read targets file {}", path.display()))?;
    serde_json::from_str(&raw).context("Failed to parse targets file")
}

fn print_plan(plan: &AllocationPlan) {
    println!("\n=== Allocation Plan ({:?}) ===", plan.method);
    println!("Created:  {}", plan.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("Capital:  ${:.2} (reserve ${:.2})", plan.total_capital, plan.reserve_capital);

    let mut rows: Vec<_> = plan.allocations.iter().collect();
    rows.sort_by(|a, b| b.1.cmp(a.1));

    println!("\n{:<24} {:>14} {:>8}", "TARGET", "CAPITAL", "SHARE");
    println!("{}", "-".repeat(48));
    for (id, capital) in rows {
        let pct = plan.allocation_pcts.get(id).copied().unwrap_or(0.0);
        println!("{:<24} {:>14.2} {:>7.1}%", truncate(id.as_str(), 24), capital, pct * 100.0);
    }

    println!("\nExpected Return:     {:.4}%", plan.expected_return * 100.0);
    println!("Expected Volatility: {:.4}%", plan.expected_volatility * 100.0);
    println!("Expected Sharpe:     {:.2}", plan.expected_sharpe);
    println!("Diversification:     {:.2}", plan.diversification_score);

    if !plan.rebalancing_actions.is_empty() {
        println!("\n--- Rebalancing ---");
        for action in &plan.rebalancing_actions {
            println!(
                "  {:<22} {:?} ${:.2} -> ${:.2} ({:.2})",
                truncate(action.target_id.as_str(), 22),
                action.direction,
                action.from_capital,
                action.to_capital,
                action.delta
            );
        }
    }
}

fn print_risk_state(state: &UserRiskState) {
    println!("\n=== Risk: {} ===", state.user_id);
    println!("Balance:        ${:.2} (peak ${:.2})", state.balance, state.peak_balance);
    println!("Drawdown:       {:.2}%", state.drawdown_pct * dec!(100));
    println!("Daily P&L:      ${:.2} (losses ${:.2})", state.daily_pnl, state.daily_losses);
    println!("Weekly P&L:     ${:.2}", state.weekly_pnl);
    println!("Entries:        {} today, {} this week, {} total",
        state.daily_trades, state.weekly_trades, state.total_trades);
    if state.circuit_breaker {
        warn!(user_id = %state.user_id, "Circuit breaker is tripped");
        println!("Breaker:        TRIPPED ({})",
            state.circuit_breaker_reason.as_deref().unwrap_or("no reason recorded"));
    } else {
        println!("Breaker:        ok");
    }
    println!("Last reset:     {}", state.last_reset_date);
}

/// Truncate a string with ellipsis if too long.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
