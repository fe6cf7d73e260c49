//! SQLite persistence: trade ledger, open positions, risk state and
//! allocation plans.
//!
//! Money is stored as TEXT so decimals round-trip exactly.

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::models::{AllocationPlan, OrderSide, Position, TradeKind, TradeRecord};

/// Fill and position store consumed by the execution gate.
#[async_trait]
pub trait TradeLedger: Send + Sync {
    /// Record a buy-side fill.
    async fn record_buy(&self, trade: &TradeRecord) -> Result<()>;

    /// Record a sell-side fill.
    async fn record_sell(&self, trade: &TradeRecord) -> Result<()>;

    async fn open_position(&self, position: &Position) -> Result<()>;

    /// Persist partial-exit progress of an open position.
    async fn update_position_remaining(&self, position: &Position) -> Result<()>;

    async fn close_position(&self, user_id: &str, symbol: &str, exit_price: Decimal) -> Result<()>;

    async fn get_open_positions(&self, user_id: Option<&str>) -> Result<Vec<Position>>;

    async fn get_statistics(&self, user_id: Option<&str>) -> Result<TradeStatistics>;
}

/// Aggregate ledger statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeStatistics {
    pub total_trades: u64,
    pub entries: u64,
    pub exits: u64,
    pub winning_exits: u64,
    pub losing_exits: u64,
    pub realized_pnl: Decimal,
    pub total_fees: Decimal,
    pub total_volume: Decimal,
    pub open_positions: u64,
}

impl TradeStatistics {
    /// Share of exits with positive realized PnL.
    pub fn win_rate(&self) -> f64 {
        let decided = self.winning_exits + self.losing_exits;
        if decided == 0 {
            return 0.0;
        }
        self.winning_exits as f64 / decided as f64
    }

    pub fn net_pnl(&self) -> Decimal {
        self.realized_pnl - self.total_fees
    }
}

impl fmt::Display for TradeStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Trades:         {} ({} entries, {} exits)", self.total_trades, self.entries, self.exits)?;
        writeln!(f, "Win rate:       {:.1}% ({}W / {}L)", self.win_rate() * 100.0, self.winning_exits, self.losing_exits)?;
        writeln!(f, "Realized PnL:   ${:.2}", self.realized_pnl)?;
        writeln!(f, "Fees:           ${:.2}", self.total_fees)?;
        writeln!(f, "Net PnL:        ${:.2}", self.net_pnl())?;
        writeln!(f, "Volume:         ${:.2}", self.total_volume)?;
        write!(f, "Open positions: {}", self.open_positions)
    }
}

/// Database connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// Stored trade row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredTrade {
    pub id: String,
    pub user_id: String,
    pub symbol: String,
    pub side: String,
    pub kind: String,
    pub quantity: String,
    pub price: String,
    pub fee: String,
    pub order_id: String,
    pub realized_pnl: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<StoredTrade> for TradeRecord {
    type Error = anyhow::Error;

    fn try_from(row: StoredTrade) -> Result<Self> {
        Ok(TradeRecord {
            side: parse_side(&row.side)?,
            kind: if row.kind == TradeKind::Exit.as_str() {
                TradeKind::Exit
            } else {
                TradeKind::Entry
            },
            quantity: parse_decimal(&row.quantity)?,
            price: parse_decimal(&row.price)?,
            fee: parse_decimal(&row.fee)?,
            realized_pnl: parse_decimal(&row.realized_pnl)?,
            id: row.id,
            user_id: row.user_id,
            symbol: row.symbol,
            order_id: row.order_id,
            reason: row.reason,
            timestamp: row.created_at,
        })
    }
}

/// Stored open position row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredPosition {
    pub id: i64,
    pub user_id: String,
    pub symbol: String,
    pub side: String,
    pub entry_price: String,
    pub quantity: String,
    pub stop_loss: String,
    pub take_profit: String,
    pub remaining_size: String,
    pub ladder_hits: String,
    pub entry_order_id: String,
    pub opened_at: DateTime<Utc>,
}

impl TryFrom<StoredPosition> for Position {
    type Error = anyhow::Error;

    fn try_from(row: StoredPosition) -> Result<Self> {
        let ladder_hits: Vec<bool> =
            serde_json::from_str(&row.ladder_hits).context("Invalid ladder flags")?;
        Ok(Position {
            side: parse_side(&row.side)?,
            entry_price: parse_decimal(&row.entry_price)?,
            quantity: parse_decimal(&row.quantity)?,
            stop_loss: parse_decimal(&row.stop_loss)?,
            take_profit: parse_decimal(&row.take_profit)?,
            remaining_size: parse_decimal(&row.remaining_size)?,
            ladder_hits,
            user_id: row.user_id,
            symbol: row.symbol,
            entry_order_id: row.entry_order_id,
            opened_at: row.opened_at,
        })
    }
}

fn parse_decimal(s: &str) -> Result<Decimal> {
    Decimal::from_str(s).with_context(|| format!("Invalid decimal in database: {}", s))
}

fn parse_side(s: &str) -> Result<OrderSide> {
    OrderSide::parse(s).with_context(|| format!("Invalid side in database: {}", s))
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        // Every in-memory connection is its own database
        let in_memory = database_url.contains(":memory:");
        let mut options = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 5 });
        if in_memory {
            options = options.idle_timeout(None).max_lifetime(None);
        }

        let pool = options
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Private in-memory database, for backtests and tests.
    pub async fn in_memory() -> Result<Self> {
        Self::new("sqlite::memory:").await
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        // Confirmed fills
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                kind TEXT NOT NULL,
                quantity TEXT NOT NULL,
                price TEXT NOT NULL,
                fee TEXT NOT NULL DEFAULT '0',
                order_id TEXT NOT NULL,
                realized_pnl TEXT NOT NULL DEFAULT '0',
                reason TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_user ON trades(user_id, created_at)")
            .execute(&self.pool)
            .await?;

        // Positions, kept after close for audit
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                stop_loss TEXT NOT NULL,
                take_profit TEXT NOT NULL,
                remaining_size TEXT NOT NULL DEFAULT '1',
                ladder_hits TEXT NOT NULL DEFAULT '[]',
                entry_order_id TEXT NOT NULL,
                opened_at TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                exit_price TEXT,
                closed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Per-user risk state as JSON
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS risk_state (
                user_id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Append-only allocation plan history
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS allocation_plans (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                method TEXT NOT NULL,
                total_capital TEXT NOT NULL,
                plan TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ==================== Trades ====================

    async fn insert_trade(&self, trade: &TradeRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trades (
                id, user_id, symbol, side, kind, quantity, price, fee,
                order_id, realized_pnl, reason, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&trade.id)
        .bind(&trade.user_id)
        .bind(&trade.symbol)
        .bind(trade.side.as_str())
        .bind(trade.kind.as_str())
        .bind(trade.quantity.to_string())
        .bind(trade.price.to_string())
        .bind(trade.fee.to_string())
        .bind(&trade.order_id)
        .bind(trade.realized_pnl.to_string())
        .bind(&trade.reason)
        .bind(trade.timestamp)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to record trade {}", trade.id))?;

        Ok(())
    }

    /// Most recent trades, newest first.
    pub async fn get_trades(&self, user_id: Option<&str>, limit: i64) -> Result<Vec<TradeRecord>> {
        let rows = sqlx::query_as::<_, StoredTrade>(
            r#"
            SELECT * FROM trades
            WHERE (?1 IS NULL OR user_id = ?1)
            ORDER BY created_at DESC
            LIMIT ?2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch trades")?;

        rows.into_iter().map(TradeRecord::try_from).collect()
    }

    // ==================== Risk State ====================

    /// Save a user's risk state JSON.
    pub async fn save_risk_state(&self, user_id: &str, state_json: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO risk_state (user_id, state) VALUES (?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                state = excluded.state,
                updated_at = datetime('now')
            "#,
        )
        .bind(user_id)
        .bind(state_json)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to save risk state for {}", user_id))?;

        Ok(())
    }

    /// Load every saved risk state as `(user_id, json)`.
    pub async fn load_risk_states(&self) -> Result<Vec<(String, String)>> {
        sqlx::query_as("SELECT user_id, state FROM risk_state ORDER BY user_id")
            .fetch_all(&self.pool)
            .await
            .context("Failed to load risk states")
    }

    // ==================== Allocation Plans ====================

    pub async fn save_allocation_plan(&self, plan: &AllocationPlan) -> Result<i64> {
        let json = serde_json::to_string(plan).context("Failed to serialize plan")?;
        let method = serde_json::to_value(plan.method)?
            .as_str()
            .unwrap_or_default()
            .to_string();

        let result = sqlx::query(
            r#"
            INSERT INTO allocation_plans (method, total_capital, plan, created_at)
            VALUES (?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(method)
        .bind(plan.total_capital.to_string())
        .bind(json)
        .bind(plan.created_at)
        .fetch_one(&self.pool)
        .await
        .context("Failed to save allocation plan")?;

        Ok(sqlx::Row::get(&result, "id"))
    }

    /// Most recent plans, newest first.
    pub async fn get_allocation_plans(&self, limit: i64) -> Result<Vec<AllocationPlan>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT plan FROM allocation_plans ORDER BY id DESC LIMIT ?")
                .bind(limit)
                .fetch_all(&self.pool)
                .await
                .context("Failed to fetch allocation plans")?;

        rows.into_iter()
            .map(|(json,)| serde_json::from_str(&json).context("Invalid stored plan"))
            .collect()
    }

    /// Get the connection pool (for advanced queries).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl TradeLedger for Database {
    async fn record_buy(&self, trade: &TradeRecord) -> Result<()> {
        anyhow::ensure!(trade.side == OrderSide::Buy, "record_buy called with a sell fill");
        self.insert_trade(trade).await
    }

    async fn record_sell(&self, trade: &TradeRecord) -> Result<()> {
        anyhow::ensure!(trade.side == OrderSide::Sell, "record_sell called with a buy fill");
        self.insert_trade(trade).await
    }

    async fn open_position(&self, position: &Position) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO positions (
                user_id, symbol, side, entry_price, quantity, stop_loss, take_profit,
                remaining_size, ladder_hits, entry_order_id, opened_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&position.user_id)
        .bind(&position.symbol)
        .bind(position.side.as_str())
        .bind(position.entry_price.to_string())
        .bind(position.quantity.to_string())
        .bind(position.stop_loss.to_string())
        .bind(position.take_profit.to_string())
        .bind(position.remaining_size.to_string())
        .bind(serde_json::to_string(&position.ladder_hits)?)
        .bind(&position.entry_order_id)
        .bind(position.opened_at)
        .execute(&self.pool)
        .await
        .context("Failed to open position")?;

        Ok(())
    }

    async fn update_position_remaining(&self, position: &Position) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE positions SET
                remaining_size = ?,
                ladder_hits = ?,
                updated_at = datetime('now')
            WHERE user_id = ? AND symbol = ? AND closed_at IS NULL
            "#,
        )
        .bind(position.remaining_size.to_string())
        .bind(serde_json::to_string(&position.ladder_hits)?)
        .bind(&position.user_id)
        .bind(&position.symbol)
        .execute(&self.pool)
        .await
        .context("Failed to update position")?;

        Ok(())
    }

    async fn close_position(&self, user_id: &str, symbol: &str, exit_price: Decimal) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE positions SET
                remaining_size = '0',
                exit_price = ?,
                closed_at = datetime('now'),
                updated_at = datetime('now')
            WHERE user_id = ? AND symbol = ? AND closed_at IS NULL
            "#,
        )
        .bind(exit_price.to_string())
        .bind(user_id)
        .bind(symbol)
        .execute(&self.pool)
        .await
        .context("Failed to close position")?;

        Ok(())
    }

    async fn get_open_positions(&self, user_id: Option<&str>) -> Result<Vec<Position>> {
        let rows = sqlx::query_as::<_, StoredPosition>(
            r#"
            SELECT id, user_id, symbol, side, entry_price, quantity, stop_loss, take_profit,
                   remaining_size, ladder_hits, entry_order_id, opened_at
            FROM positions
            WHERE closed_at IS NULL AND (?1 IS NULL OR user_id = ?1)
            ORDER BY id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch positions")?;

        rows.into_iter().map(Position::try_from).collect()
    }

    async fn get_statistics(&self, user_id: Option<&str>) -> Result<TradeStatistics> {
        let trades = self.get_trades(user_id, i64::MAX).await?;

        let mut stats = TradeStatistics {
            total_trades: trades.len() as u64,
            ..Default::default()
        };
        for trade in &trades {
            stats.total_fees += trade.fee;
            stats.total_volume += trade.notional();
            match trade.kind {
                TradeKind::Entry => stats.entries += 1,
                TradeKind::Exit => {
                    stats.exits += 1;
                    stats.realized_pnl += trade.realized_pnl;
                    if trade.realized_pnl > Decimal::ZERO {
                        stats.winning_exits += 1;
                    } else if trade.realized_pnl < Decimal::ZERO {
                        stats.losing_exits += 1;
                    }
                }
            }
        }

        let (open,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM positions WHERE closed_at IS NULL AND (?1 IS NULL OR user_id = ?1)",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        stats.open_positions = open as u64;

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn trade(side: OrderSide, kind: TradeKind, pnl: Decimal) -> TradeRecord {
        TradeRecord {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: "alice".to_string(),
            symbol: "BTC-USD".to_string(),
            side,
            kind,
            quantity: dec!(0.5),
            price: dec!(100),
            fee: dec!(0.35),
            order_id: "o-1".to_string(),
            realized_pnl: pnl,
            reason: String::new(),
            timestamp: Utc::now(),
        }
    }

    fn position() -> Position {
        Position::new(
            "alice".to_string(),
            "BTC-USD".to_string(),
            OrderSide::Buy,
            dec!(100.25),
            dec!(0.5),
            dec!(98),
            dec!(105),
            4,
            "o-1".to_string(),
        )
    }

    #[tokio::test]
    async fn test_position_lifecycle() {
        let db = Database::in_memory().await.unwrap();
        let mut pos = position();

        db.open_position(&pos).await.unwrap();
        pos.reduce(dec!(0.1));
        pos.ladder_hits[0] = true;
        db.update_position_remaining(&pos).await.unwrap();

        let open = db.get_open_positions(Some("alice")).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].remaining_size, dec!(0.9));
        assert_eq!(open[0].entry_price, dec!(100.25));
        assert_eq!(open[0].ladder_hits, vec![true, false, false, false]);

        db.close_position("alice", "BTC-USD", dec!(103)).await.unwrap();
        assert!(db.get_open_positions(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_statistics() {
        let db = Database::in_memory().await.unwrap();

        db.record_buy(&trade(OrderSide::Buy, TradeKind::Entry, Decimal::ZERO)).await.unwrap();
        db.record_sell(&trade(OrderSide::Sell, TradeKind::Exit, dec!(2))).await.unwrap();
        db.record_sell(&trade(OrderSide::Sell, TradeKind::Exit, dec!(-1))).await.unwrap();

        let stats = db.get_statistics(Some("alice")).await.unwrap();
        assert_eq!(stats.total_trades, 3);
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.exits, 2);
        assert_eq!(stats.realized_pnl, dec!(1));
        assert_eq!(stats.total_fees, dec!(1.05));
        assert!((stats.win_rate() - 0.5).abs() < 1e-9);

        assert_eq!(db.get_statistics(Some("bob")).await.unwrap().total_trades, 0);
    }

    #[tokio::test]
    async fn test_record_side_mismatch_rejected() {
        let db = Database::in_memory().await.unwrap();
        assert!(db
            .record_buy(&trade(OrderSide::Sell, TradeKind::Exit, Decimal::ZERO))
            .await
            .is_err());
        assert_eq!(db.get_trades(None, 10).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_risk_state_upsert() {
        let db = Database::in_memory().await.unwrap();
        db.save_risk_state("alice", r#"{"balance":"1000"}"#).await.unwrap();
        db.save_risk_state("alice", r#"{"balance":"965"}"#).await.unwrap();

        let states = db.load_risk_states().await.unwrap();
        assert_eq!(states.len(), 1);
        assert!(states[0].1.contains("965"));
    }
}
