//! SQLite persistence for strategy state and history.
//!
//! Persists what is needed to resume after a restart and to review a run:
//! - The latest state snapshot
//! - Executed trades
//! - Periodic P&L snapshots

use crate::snapshot::StateSnapshot;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// A trade as recorded in history.
#[derive(Debug, Clone)]
pub struct TradeRecord {
    pub timestamp: DateTime<Utc>,
    /// "spot" or "futures"
    pub market: String,
    pub side: String,
    pub quantity: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    /// What triggered the trade (e.g. "hedge_opened h1")
    pub reason: String,
}

/// A periodic P&L observation.
#[derive(Debug, Clone)]
pub struct PnlRecord {
    pub timestamp: DateTime<Utc>,
    pub price: Decimal,
    pub equity: Decimal,
    pub pnl: Decimal,
    pub pnl_pct: Decimal,
    pub funding_cost: Decimal,
    pub commissions: Decimal,
}

/// SQLite-backed snapshot store.
pub struct SnapshotStore {
    conn: Connection,
}

impl SnapshotStore {
    /// Open (or create) the database and make sure the schema exists.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        let store = Self { conn };
        store.init_schema()?;

        info!("Snapshot store initialized at {:?}", db_path.as_ref());
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            -- Latest strategy state (singleton row)
            CREATE TABLE IF NOT EXISTS strategy_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                snapshot TEXT NOT NULL,
                saved_at TEXT NOT NULL
            );

            -- Trade history
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                market TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity TEXT NOT NULL,
                price TEXT NOT NULL,
                fee TEXT NOT NULL,
                reason TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trades_timestamp ON trades(timestamp);

            -- P&L snapshots
            CREATE TABLE IF NOT EXISTS pnl_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                price TEXT NOT NULL,
                equity TEXT NOT NULL,
                pnl TEXT NOT NULL,
                pnl_pct TEXT NOT NULL,
                funding_cost TEXT NOT NULL,
                commissions TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_pnl_timestamp ON pnl_snapshots(timestamp);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Replace the stored state snapshot.
    pub fn save_snapshot(&self, snapshot: &StateSnapshot, saved_at: DateTime<Utc>) -> Result<()> {
        let json = serde_json::to_string(snapshot).context("Failed to serialize snapshot")?;

        self.conn.execute(
            r#"
            INSERT INTO strategy_state (id, snapshot, saved_at)
            VALUES (1, ?1, ?2)
            ON CONFLICT(id) DO UPDATE SET
                snapshot = ?1,
                saved_at = ?2
            "#,
            params![json, saved_at.to_rfc3339()],
        )?;

        debug!(status = %snapshot.status, "State snapshot saved");
        Ok(())
    }

    /// Load the stored snapshot and when it was saved.
    pub fn load_snapshot(&self) -> Result<Option<(StateSnapshot, DateTime<Utc>)>> {
        let row: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT snapshot, saved_at FROM strategy_state WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((json, saved_at)) = row else {
            return Ok(None);
        };

        let snapshot: StateSnapshot =
            serde_json::from_str(&json).context("Stored snapshot is not valid JSON")?;
        let saved_at = DateTime::parse_from_rfc3339(&saved_at)
            .map(|dt| dt.with_timezone(&Utc))
            .context("Stored snapshot has an invalid timestamp")?;

        Ok(Some((snapshot, saved_at)))
    }

    pub fn has_state(&self) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM strategy_state WHERE id = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn record_trade(&self, trade: &TradeRecord) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO trades (timestamp, market, side, quantity, price, fee, reason)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                trade.timestamp.to_rfc3339(),
                trade.market,
                trade.side,
                trade.quantity.to_string(),
                trade.price.to_string(),
                trade.fee.to_string(),
                trade.reason,
            ],
        )?;
        Ok(())
    }

    pub fn record_pnl(&self, record: &PnlRecord) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO pnl_snapshots (timestamp, price, equity, pnl, pnl_pct,
                                       funding_cost, commissions)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                record.timestamp.to_rfc3339(),
                record.price.to_string(),
                record.equity.to_string(),
                record.pnl.to_string(),
                record.pnl_pct.to_string(),
                record.funding_cost.to_string(),
                record.commissions.to_string(),
            ],
        )?;
        Ok(())
    }

    /// Most recent trades, newest first.
    pub fn recent_trades(&self, limit: usize) -> Result<Vec<TradeRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT timestamp, market, side, quantity, price, fee, reason
            FROM trades
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )?;

        let trades = stmt
            .query_map([limit], |row| {
                Ok(TradeRecord {
                    timestamp: timestamp_column(row, 0)?,
                    market: row.get(1)?,
                    side: row.get(2)?,
                    quantity: decimal_column(row, 3)?,
                    price: decimal_column(row, 4)?,
                    fee: decimal_column(row, 5)?,
                    reason: row.get(6)?,
                })
            })?
            .filter_map(|r| readable(r, "trades"))
            .collect();

        Ok(trades)
    }

    /// Most recent P&L snapshots, newest first.
    pub fn recent_pnl(&self, limit: usize) -> Result<Vec<PnlRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT timestamp, price, equity, pnl, pnl_pct, funding_cost, commissions
            FROM pnl_snapshots
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )?;

        let records = stmt
            .query_map([limit], |row| {
                Ok(PnlRecord {
                    timestamp: timestamp_column(row, 0)?,
                    price: decimal_column(row, 1)?,
                    equity: decimal_column(row, 2)?,
                    pnl: decimal_column(row, 3)?,
                    pnl_pct: decimal_column(row, 4)?,
                    funding_cost: decimal_column(row, 5)?,
                    commissions: decimal_column(row, 6)?,
                })
            })?
            .filter_map(|r| readable(r, "pnl_snapshots"))
            .collect();

        Ok(records)
    }

    /// Clear all data (for testing or reset).
    pub fn clear_all(&self) -> Result<()> {
        warn!("Clearing all persistence data");
        self.conn.execute_batch(
            r#"
            DELETE FROM strategy_state;
            DELETE FROM trades;
            DELETE FROM pnl_snapshots;
            "#,
        )?;
        Ok(())
    }
}

/// Keep a history row, or log and drop it if it could not be read.
fn readable<T>(row: rusqlite::Result<T>, table: &'static str) -> Option<T> {
    match row {
        Ok(record) => Some(record),
        Err(e) => {
            warn!(table, error = %e, "Skipping unreadable history row");
            None
        }
    }
}

fn decimal_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let value: String = row.get(idx)?;
    Decimal::from_str(&value)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let value: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StrategyConfig;
    use crate::snapshot::{from_snapshot, to_snapshot};
    use crate::strategy::StrategyEngine;
    use rust_decimal_macros::dec;

    #[test]
    fn test_save_and_load_snapshot() {
        let store = SnapshotStore::new(":memory:").unwrap();
        assert!(!store.has_state().unwrap());
        assert!(store.load_snapshot().unwrap().is_none());

        let engine = StrategyEngine::new(StrategyConfig::default());
        let state = engine.initialize(dec!(2500), dec!(1000)).unwrap();
        let saved_at = Utc::now();
        store.save_snapshot(&to_snapshot(&state), saved_at).unwrap();

        // Second save overwrites the singleton row
        let mut moved = state.clone();
        moved.update_price(dec!(2600));
        store.save_snapshot(&to_snapshot(&moved), saved_at).unwrap();

        let (snapshot, _) = store.load_snapshot().unwrap().unwrap();
        assert!(store.has_state().unwrap());
        assert_eq!(from_snapshot(&snapshot).unwrap(), moved);
    }

    #[test]
    fn test_trade_and_pnl_history() {
        let store = SnapshotStore::new(":memory:").unwrap();
        let now = Utc::now();

        for (i, reason) in ["initial_buy", "hedge_opened h1"].iter().enumerate() {
            store
                .record_trade(&TradeRecord {
                    timestamp: now,
                    market: "spot".to_string(),
                    side: "buy".to_string(),
                    quantity: dec!(0.15) + Decimal::from(i as u32),
                    price: dec!(2500),
                    fee: dec!(0.375),
                    reason: reason.to_string(),
                })
                .unwrap();
        }

        store
            .record_pnl(&PnlRecord {
                timestamp: now,
                price: dec!(2450),
                equity: dec!(742.5),
                pnl: dec!(-257.5),
                pnl_pct: dec!(-25.75),
                funding_cost: dec!(0.01),
                commissions: dec!(0.4),
            })
            .unwrap();

        let trades = store.recent_trades(10).unwrap();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].reason, "hedge_opened h1");
        assert_eq!(trades[1].quantity, dec!(0.15));

        let pnl = store.recent_pnl(5).unwrap();
        assert_eq!(pnl.len(), 1);
        assert_eq!(pnl[0].pnl, dec!(-257.5));

        store.clear_all().unwrap();
        assert!(store.recent_trades(10).unwrap().is_empty());
    }

    #[test]
    fn test_unreadable_history_rows_are_skipped() {
        let store = SnapshotStore::new(":memory:").unwrap();
        let now = Utc::now();

        store
            .record_trade(&TradeRecord {
                timestamp: now,
                market: "futures".to_string(),
                side: "sell".to_string(),
                quantity: dec!(0.05),
                price: dec!(1950),
                fee: dec!(0.039),
                reason: "hedge_opened h1".to_string(),
            })
            .unwrap();
        store
            .conn
            .execute(
                "INSERT INTO trades (timestamp, market, side, quantity, price, fee, reason)
                 VALUES ('yesterday', 'spot', 'buy', 'lots', '1950', '0', 'corrupt')",
                [],
            )
            .unwrap();

        // Corrupt row dropped instead of read back as zeros
        let trades = store.recent_trades(10).unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].quantity, dec!(0.05));
        assert_eq!(trades[0].timestamp.timestamp(), now.timestamp());
    }
}
