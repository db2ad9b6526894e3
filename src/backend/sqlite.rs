use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Row};
use tracing::{debug, info};

use crate::backend::pool::ConnectionPool;
use crate::backend::valid_table_name;
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::types::{CandleRecord, TableLayout};

const COLUMNS: &str = "date, open, close, high, low";

/// Row counts reported by [`SqliteBackend::upsert`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// Dates that were not present before the batch.
    pub inserted: usize,
    /// Dates whose existing row was overwritten.
    pub updated: usize,
}

/// Durable candle table keyed by a unique `date` (epoch seconds).
///
/// Every query returns rows ordered by date ascending.
pub struct SqliteBackend {
    pool: ConnectionPool,
    table: String,
    layout: TableLayout,
}

impl SqliteBackend {
    /// Open the database described by `config` and make sure the table exists.
    pub fn open(config: &StoreConfig) -> StoreResult<Self> {
        let pool = ConnectionPool::open(
            &config.db_path,
            &config.journal_mode,
            config.busy_timeout(),
        )?;
        Self::new(pool, &config.table, config.layout)
    }

    /// Build a backend on an existing pool.
    pub fn new(pool: ConnectionPool, table: &str, layout: TableLayout) -> StoreResult<Self> {
        if !valid_table_name(table) {
            return Err(StoreError::InvalidTable(table.to_string()));
        }
        let backend = Self {
            pool,
            table: table.to_string(),
            layout,
        };
        backend.create_table()?;
        Ok(backend)
    }

    fn create_table(&self) -> StoreResult<()> {
        let t = &self.table;
        let columns = match self.layout {
            TableLayout::Standard => "date INTEGER NOT NULL,",
            TableLayout::Legacy => {
                "idx INTEGER PRIMARY KEY,\n                date INTEGER NOT NULL,"
            }
        };
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {t} (
                {columns}
                open REAL NOT NULL,
                close REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS {t}_date ON {t} (date);"
        );
        self.pool.with_conn(|conn| Ok(conn.execute_batch(&ddl)?))
    }

    /// Drop the table and recreate it empty.
    pub fn drop_and_recreate(&self) -> StoreResult<()> {
        let t = &self.table;
        self.pool
            .with_conn(|conn| Ok(conn.execute_batch(&format!("DROP TABLE IF EXISTS {t};"))?))?;
        self.create_table()?;
        info!(table = %t, "backing table recreated");
        Ok(())
    }

    /// Insert or overwrite `rows` by date in a single transaction. Nothing is
    /// applied if any row fails.
    pub fn upsert(&self, rows: &[CandleRecord]) -> StoreResult<UpsertOutcome> {
        if rows.is_empty() {
            return Ok(UpsertOutcome::default());
        }
        let t = &self.table;
        let exists_sql = format!("SELECT 1 FROM {t} WHERE date = ?1");
        let write_sql = format!(
            "INSERT INTO {t} ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(date) DO UPDATE SET
                open = excluded.open,
                close = excluded.close,
                high = excluded.high,
                low = excluded.low"
        );

        let outcome = self.pool.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut outcome = UpsertOutcome::default();
            {
                let mut exists = tx.prepare_cached(&exists_sql)?;
                let mut write = tx.prepare_cached(&write_sql)?;
                for r in rows {
                    if exists.exists(params![r.epoch()])? {
                        outcome.updated += 1;
                    } else {
                        outcome.inserted += 1;
                    }
                    write.execute(params![r.epoch(), r.open, r.close, r.high, r.low])?;
                }
            }
            tx.commit()?;
            Ok(outcome)
        })?;

        debug!(
            table = %t,
            inserted = outcome.inserted,
            updated = outcome.updated,
            "upsert committed"
        );
        Ok(outcome)
    }

    pub fn count(&self) -> StoreResult<usize> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.table);
        let n: i64 = self
            .pool
            .with_conn(|conn| Ok(conn.query_row(&sql, [], |row| row.get(0))?))?;
        Ok(n as usize)
    }

    /// Earliest stored date, `None` when the table is empty.
    pub fn min_date(&self) -> StoreResult<Option<DateTime<Utc>>> {
        self.aggregate_date("MIN")
    }

    /// Latest stored date, `None` when the table is empty.
    pub fn max_date(&self) -> StoreResult<Option<DateTime<Utc>>> {
        self.aggregate_date("MAX")
    }

    fn aggregate_date(&self, func: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let sql = format!("SELECT {func}(date) FROM {}", self.table);
        let secs: Option<i64> = self
            .pool
            .with_conn(|conn| Ok(conn.query_row(&sql, [], |row| row.get(0))?))?;
        secs.map(crate::types::from_epoch).transpose()
    }

    /// Rows with `start <= date < end`. Open bounds are unbounded.
    pub fn rows_by_date(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<CandleRecord>> {
        let lo = start.map_or(i64::MIN, |d| d.timestamp());
        let hi = end.map_or(i64::MAX, |d| d.timestamp());
        if lo >= hi {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {COLUMNS} FROM {} WHERE date >= ?1 AND date < ?2 ORDER BY date",
            self.table
        );
        self.select(&sql, params![lo, hi])
    }

    /// Rows at positions `[start, end)` of the date-ordered table.
    pub fn rows_by_position(&self, start: usize, end: usize) -> StoreResult<Vec<CandleRecord>> {
        if start >= end {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {COLUMNS} FROM {} ORDER BY date LIMIT ?1 OFFSET ?2",
            self.table
        );
        self.select(&sql, params![(end - start) as i64, start as i64])
    }

    /// Rows whose SQLite rowid (the `idx` column in the legacy layout) lies in
    /// `[start, end)`, ordered by date.
    pub fn rows_by_rowid(&self, start: i64, end: i64) -> StoreResult<Vec<CandleRecord>> {
        if start >= end {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {COLUMNS} FROM {} WHERE rowid >= ?1 AND rowid < ?2 ORDER BY date",
            self.table
        );
        self.select(&sql, params![start, end])
    }

    pub fn row_at(&self, date: DateTime<Utc>) -> StoreResult<Option<CandleRecord>> {
        let sql = format!("SELECT {COLUMNS} FROM {} WHERE date = ?1", self.table);
        Ok(self.select(&sql, params![date.timestamp()])?.into_iter().next())
    }

    fn select(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> StoreResult<Vec<CandleRecord>> {
        self.pool.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            let rows = stmt
                .query_map(params, record_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn layout(&self) -> TableLayout {
        self.layout
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<CandleRecord> {
    let secs: i64 = row.get(0)?;
    let date = Utc
        .timestamp_opt(secs, 0)
        .single()
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(0, secs))?;
    Ok(CandleRecord {
        date,
        open: row.get(1)?,
        close: row.get(2)?,
        high: row.get(3)?,
        low: row.get(4)?,
    })
}
