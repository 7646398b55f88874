use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::aggregate::{AggregateKey, AggregateRow};
use crate::error::StoreError;

// ============================================================================
// STORE CONTRACT
// ============================================================================

/// How a row is written when its key may already exist
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertMode {
    /// Native `INSERT … ON CONFLICT DO UPDATE`
    #[default]
    Native,
    /// Select, then update or insert, inside the open transaction
    ReadThenWrite,
}

/// One open write batch against the aggregate table.
///
/// Nothing staged through `execute_upsert` is visible to other connections
/// until `commit`. Dropping the batch without committing discards it.
pub trait AggregateStore {
    /// Insert the row, or replace the stored total if the key exists.
    /// A failure must leave the rest of the batch intact.
    fn execute_upsert(&mut self, row: &AggregateRow) -> Result<(), StoreError>;

    /// Stage the audit record for this run alongside the data
    fn record_run(&mut self, run: &LoadRun) -> Result<(), StoreError>;

    fn commit(self) -> Result<(), StoreError>;

    fn rollback(self) -> Result<(), StoreError>;
}

// ============================================================================
// AUDIT TRAIL
// ============================================================================

/// One committed load run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadRun {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub staged: i64,
    pub skipped: i64,
    pub status: String,
    pub detail: serde_json::Value,
}

impl LoadRun {
    pub fn new(run_id: &str, started_at: DateTime<Utc>, staged: usize, skipped: usize) -> Self {
        LoadRun {
            run_id: run_id.to_string(),
            started_at,
            finished_at: Utc::now(),
            staged: staged as i64,
            skipped: skipped as i64,
            status: "committed".to_string(),
            detail: serde_json::Value::Null,
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

// ============================================================================
// SQLITE SETUP
// ============================================================================

/// Open (or create) the store and bound lock waits by `timeout`
pub fn connect(path: &Path, timeout: Duration) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(timeout)?;
    setup_database(&conn)?;
    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> Result<(), StoreError> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // Totals are kept as decimal text so they round-trip exactly
    conn.execute(
        "CREATE TABLE IF NOT EXISTS transaction_aggregates (
            bank_id INTEGER NOT NULL,
            date TEXT NOT NULL,
            total_transaction_volume TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (bank_id, date)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS load_runs (
            run_id TEXT PRIMARY KEY,
            started_at TEXT NOT NULL,
            finished_at TEXT NOT NULL,
            staged INTEGER NOT NULL,
            skipped INTEGER NOT NULL,
            status TEXT NOT NULL,
            detail TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_aggregates_date ON transaction_aggregates(date)",
        [],
    )?;

    Ok(())
}

fn date_text(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

// ============================================================================
// SQLITE BATCH
// ============================================================================

/// Write batch over a single immediate-mode SQLite transaction.
///
/// Every row runs in its own savepoint: a failing row is rolled back alone.
pub struct SqliteBatch<'c> {
    tx: rusqlite::Transaction<'c>,
    mode: UpsertMode,
}

impl<'c> SqliteBatch<'c> {
    pub fn begin(conn: &'c mut Connection, mode: UpsertMode) -> Result<Self, StoreError> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        Ok(SqliteBatch { tx, mode })
    }
}

fn upsert_native(conn: &Connection, row: &AggregateRow, now: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO transaction_aggregates (bank_id, date, total_transaction_volume, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(bank_id, date) DO UPDATE SET
            total_transaction_volume = excluded.total_transaction_volume,
            updated_at = excluded.updated_at",
        params![
            row.key.bank_id,
            date_text(row.key.date),
            row.total_transaction_volume.to_string(),
            now,
        ],
    )?;
    Ok(())
}

fn upsert_read_then_write(conn: &Connection, row: &AggregateRow, now: &str) -> rusqlite::Result<()> {
    let date = date_text(row.key.date);
    let exists = conn
        .query_row(
            "SELECT 1 FROM transaction_aggregates WHERE bank_id = ?1 AND date = ?2",
            params![row.key.bank_id, date],
            |_| Ok(()),
        )
        .optional()?
        .is_some();

    if exists {
        conn.execute(
            "UPDATE transaction_aggregates
             SET total_transaction_volume = ?3, updated_at = ?4
             WHERE bank_id = ?1 AND date = ?2",
            params![row.key.bank_id, date, row.total_transaction_volume.to_string(), now],
        )?;
    } else {
        conn.execute(
            "INSERT INTO transaction_aggregates (bank_id, date, total_transaction_volume, updated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![row.key.bank_id, date, row.total_transaction_volume.to_string(), now],
        )?;
    }
    Ok(())
}

impl<'c> AggregateStore for SqliteBatch<'c> {
    fn execute_upsert(&mut self, row: &AggregateRow) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let sp = self.tx.savepoint()?;

        match self.mode {
            UpsertMode::Native => upsert_native(&sp, row, &now)?,
            UpsertMode::ReadThenWrite => upsert_read_then_write(&sp, row, &now)?,
        }

        sp.commit()?;
        Ok(())
    }

    fn record_run(&mut self, run: &LoadRun) -> Result<(), StoreError> {
        insert_load_run(&self.tx, run)
    }

    fn commit(self) -> Result<(), StoreError> {
        self.tx.commit()?;
        Ok(())
    }

    fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback()?;
        Ok(())
    }
}

// ============================================================================
// QUERIES
// ============================================================================

fn conversion_error<E>(index: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(err))
}

fn row_to_aggregate(row: &rusqlite::Row) -> rusqlite::Result<AggregateRow> {
    let bank_id: i64 = row.get(0)?;
    let date: String = row.get(1)?;
    let total: String = row.get(2)?;

    let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d").map_err(|e| conversion_error(1, e))?;
    let total = Decimal::from_str(&total).map_err(|e| conversion_error(2, e))?;

    Ok(AggregateRow::new(bank_id, date, total))
}

pub fn get_aggregate(conn: &Connection, key: &AggregateKey) -> Result<Option<Decimal>, StoreError> {
    let row = conn
        .query_row(
            "SELECT bank_id, date, total_transaction_volume
             FROM transaction_aggregates
             WHERE bank_id = ?1 AND date = ?2",
            params![key.bank_id, date_text(key.date)],
            row_to_aggregate,
        )
        .optional()?;

    Ok(row.map(|r| r.total_transaction_volume))
}

pub fn get_all_aggregates(conn: &Connection) -> Result<Vec<AggregateRow>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT bank_id, date, total_transaction_volume
         FROM transaction_aggregates
         ORDER BY bank_id, date",
    )?;

    let rows = stmt
        .query_map([], row_to_aggregate)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows)
}

pub fn count_aggregates(conn: &Connection) -> Result<i64, StoreError> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM transaction_aggregates", [], |row| {
        row.get(0)
    })?;

    Ok(count)
}

/// Insert a run into the audit trail
pub fn insert_load_run(conn: &Connection, run: &LoadRun) -> Result<(), StoreError> {
    let detail = serde_json::to_string(&run.detail)
        .map_err(|e| StoreError::Rejected(format!("unserialisable run detail: {}", e)))?;

    conn.execute(
        "INSERT INTO load_runs (
            run_id, started_at, finished_at, staged, skipped, status, detail
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            run.run_id,
            run.started_at.to_rfc3339(),
            run.finished_at.to_rfc3339(),
            run.staged,
            run.skipped,
            run.status,
            detail,
        ],
    )?;

    Ok(())
}

pub fn get_load_runs(conn: &Connection) -> Result<Vec<LoadRun>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT run_id, started_at, finished_at, staged, skipped, status, detail
         FROM load_runs
         ORDER BY started_at",
    )?;

    let runs = stmt
        .query_map([], |row| {
            let started_at: String = row.get(1)?;
            let finished_at: String = row.get(2)?;
            let detail: String = row.get(6)?;

            Ok(LoadRun {
                run_id: row.get(0)?,
                started_at: DateTime::parse_from_rfc3339(&started_at)
                    .map_err(|e| conversion_error(1, e))?
                    .with_timezone(&Utc),
                finished_at: DateTime::parse_from_rfc3339(&finished_at)
                    .map_err(|e| conversion_error(2, e))?
                    .with_timezone(&Utc),
                staged: row.get(3)?,
                skipped: row.get(4)?,
                status: row.get(5)?,
                detail: serde_json::from_str(&detail).map_err(|e| conversion_error(6, e))?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(runs)
}
