// =============================================================================
// Tiered Candle Store — bounded in-memory buffer over a durable SQLite table
// =============================================================================
//
// The newest candles live in memory. Once the buffer grows past `max_size`
// the oldest records are moved to disk until `min_size` remain. Queries by
// position, date range or calendar period are answered across both tiers.
//
// Thread safety:
//   - One parking_lot::RwLock guards the memory tier (buffer, counters, flush
//     boundary). `append`, `free`, `flush` and `clear` hold the write lock for
//     their whole duration, backend calls included, so there is exactly one
//     writer at a time.
//   - Queries hold the read lock while they read the backend, so a query
//     never observes a half-finished eviction.
//   - Each thread talks to SQLite through its own connection (see
//     `backend::pool`).
//
// Invariants after every public call:
//   - len == persisted + buffer.len()
//   - every date <= boundary is on disk; the buffer holds only later dates
//   - the buffer is truncated only after its evicted rows have committed
// =============================================================================

pub mod buffer;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::addressing::{
    parse_period, resolve_date_text, resolve_index, resolve_slice, route_dates,
    route_positions, DateRoute, PositionRoute, Query,
};
use crate::backend::SqliteBackend;
use crate::config::{StoreConfig, TierLimits};
use crate::error::{StoreError, StoreResult};
use crate::types::CandleRecord;

pub use buffer::CandleBuffer;

/// Watermark between persisted and buffered records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlushBoundary {
    /// Latest date known to be on disk.
    pub date: DateTime<Utc>,
    /// Number of rows on disk, i.e. the first logical index held in memory.
    pub persisted: usize,
}

/// What a call to [`TieredCandleStore::append`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AppendOutcome {
    /// Records in the batch.
    pub received: usize,
    /// Dates that did not exist anywhere in the store before.
    pub added: usize,
    /// Records dated at or before the flush boundary, written straight to disk.
    pub late: usize,
    /// Records moved from memory to disk by the eviction pass.
    pub evicted: usize,
}

#[derive(Debug, Default)]
struct MemoryTier {
    buffer: CandleBuffer,
    persisted: usize,
    len: usize,
    boundary: Option<DateTime<Utc>>,
}

pub struct TieredCandleStore {
    backend: SqliteBackend,
    limits: TierLimits,
    tier: RwLock<MemoryTier>,
}

impl TieredCandleStore {
    /// Open (or resume) the store described by `config` on the calling thread.
    pub fn open(config: &StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        let backend = SqliteBackend::open(config)?;
        Self::with_backend(backend, config.limits())
    }

    /// Wrap an already opened backend. Rows already on disk are counted once
    /// and their latest date becomes the flush boundary.
    pub fn with_backend(backend: SqliteBackend, limits: TierLimits) -> StoreResult<Self> {
        limits.validate()?;
        let persisted = backend.count()?;
        let boundary = backend.max_date()?;

        info!(
            table = %backend.table(),
            persisted,
            boundary = ?boundary,
            min_size = limits.min_size,
            max_size = limits.max_size,
            "candle store opened"
        );

        Ok(Self {
            backend,
            limits,
            tier: RwLock::new(MemoryTier {
                buffer: CandleBuffer::new(),
                persisted,
                len: persisted,
                boundary,
            }),
        })
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Add a batch of candles in any order.
    ///
    /// The batch is validated up front and refused as a whole if any record is
    /// malformed. Duplicate dates keep the value appended last, whichever tier
    /// currently holds that date.
    pub fn append(
        &self,
        batch: impl IntoIterator<Item = CandleRecord>,
    ) -> StoreResult<AppendOutcome> {
        let batch: Vec<CandleRecord> = batch.into_iter().collect();
        if let Some(err) = batch.iter().find_map(|c| c.validate().err()) {
            warn!(size = batch.len(), error = %err, "rejected candle batch");
            return Err(err);
        }

        let mut tier = self.tier.write();
        let mut outcome = AppendOutcome {
            received: batch.len(),
            ..AppendOutcome::default()
        };

        let (late, fresh): (Vec<CandleRecord>, Vec<CandleRecord>) = match tier.boundary {
            Some(boundary) => batch.into_iter().partition(|c| c.date <= boundary),
            None => (Vec::new(), batch),
        };

        if !late.is_empty() {
            let written = self.backend.upsert(&late)?;
            tier.persisted += written.inserted;
            tier.len += written.inserted;
            outcome.late = late.len();
            outcome.added += written.inserted;
        }

        let added = tier.buffer.merge(fresh);
        tier.len += added;
        outcome.added += added;

        outcome.evicted = self.evict(&mut tier, self.limits.min_size)?;

        debug!(
            received = outcome.received,
            added = outcome.added,
            late = outcome.late,
            evicted = outcome.evicted,
            len = tier.len,
            buffered = tier.buffer.len(),
            "append applied"
        );
        Ok(outcome)
    }

    /// Run the eviction policy: when the buffer holds more than `max_size`
    /// records, move the oldest to disk until `min_size` remain.
    pub fn free(&self) -> StoreResult<usize> {
        let mut tier = self.tier.write();
        self.evict(&mut tier, self.limits.min_size)
    }

    /// Move every buffered record to disk, regardless of the size limits.
    /// Call before dropping the store to keep the buffered tail.
    pub fn flush(&self) -> StoreResult<usize> {
        let mut tier = self.tier.write();
        let n = tier.buffer.len();
        self.move_oldest(&mut tier, n)
    }

    fn evict(&self, tier: &mut MemoryTier, keep: usize) -> StoreResult<usize> {
        let buffered = tier.buffer.len();
        if buffered <= self.limits.max_size {
            return Ok(0);
        }
        self.move_oldest(tier, buffered - keep)
    }

    fn move_oldest(&self, tier: &mut MemoryTier, n: usize) -> StoreResult<usize> {
        if n == 0 {
            return Ok(0);
        }
        let moving = tier.buffer.oldest(n);
        let Some(last) = moving.last().map(|c| c.date) else {
            return Ok(0);
        };

        // Commit first: on failure the rows are still in memory.
        let written = self.backend.upsert(&moving)?;
        tier.buffer.drop_oldest(moving.len());
        tier.persisted += written.inserted;
        if written.updated > 0 {
            // Someone else wrote these dates to the table; they now count once.
            warn!(
                updated = written.updated,
                "evicted dates already present on disk"
            );
            tier.len -= written.updated;
        }
        tier.boundary = Some(last);

        debug!(
            moved = moving.len(),
            boundary = %last,
            persisted = tier.persisted,
            buffered = tier.buffer.len(),
            "buffer flushed to disk"
        );
        Ok(moving.len())
    }

    /// Drop every record from both tiers.
    pub fn clear(&self) -> StoreResult<()> {
        let mut tier = self.tier.write();
        self.backend.drop_and_recreate()?;
        *tier = MemoryTier::default();
        info!(table = %self.backend.table(), "candle store cleared");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Look up records by index, slice, calendar period, date range or exact
    /// date. Results are always ascending by date.
    ///
    /// ```ignore
    /// store.get(-1_i64)?;                 // newest record
    /// store.get(0_i64..100)?;             // first hundred
    /// store.get("2024-03")?;              // all of March 2024
    /// store.get(start..end)?;             // DateTime<Utc> range
    /// store.get("2024-03-01".."2024-03-08")?;
    /// ```
    pub fn get(&self, query: impl Into<Query>) -> StoreResult<Vec<CandleRecord>> {
        let query = query.into();
        let tier = self.tier.read();

        match query {
            Query::Index(index) => {
                if tier.len == 0 {
                    return Ok(Vec::new());
                }
                let pos = resolve_index(index, tier.len)?;
                self.positions(&tier, pos..pos + 1)
            }
            Query::Slice { start, end } => {
                if tier.len == 0 {
                    return Ok(Vec::new());
                }
                let range = resolve_slice(start, end, tier.len)?;
                self.positions(&tier, range)
            }
            Query::Period(key) => {
                let (start, end) = parse_period(&key)?;
                self.dates(&tier, Some(start), Some(end))
            }
            Query::Dates { start, end } => self.dates(&tier, start, end),
            Query::DateText { start, end } => {
                let (start, end) = resolve_date_text(start.as_deref(), end.as_deref())?;
                self.dates(&tier, start, end)
            }
            Query::At(date) => {
                let on_disk = tier.boundary.is_some_and(|b| date <= b);
                let found = if on_disk {
                    self.backend.row_at(date)?
                } else {
                    tier.buffer.at(date)
                };
                Ok(found.into_iter().collect())
            }
        }
    }

    /// The single record at logical position `index`.
    pub fn record(&self, index: i64) -> StoreResult<CandleRecord> {
        self.get(Query::Index(index))?
            .into_iter()
            .next()
            .ok_or(StoreError::IndexOutOfRange { index, len: 0 })
    }

    fn positions(
        &self,
        tier: &MemoryTier,
        range: std::ops::Range<usize>,
    ) -> StoreResult<Vec<CandleRecord>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let route = route_positions(range, tier.persisted);
        debug!(route = ?route, "position query");
        match route {
            PositionRoute::Backend(r) => self.backend.rows_by_position(r.start, r.end),
            PositionRoute::Buffer(r) => Ok(tier.buffer.slice(r)),
            PositionRoute::Split { backend, buffer } => {
                let mut rows = self.backend.rows_by_position(backend.start, backend.end)?;
                rows.extend(tier.buffer.slice(buffer));
                Ok(rows)
            }
        }
    }

    fn dates(
        &self,
        tier: &MemoryTier,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<CandleRecord>> {
        if let (Some(s), Some(e)) = (start, end) {
            if s >= e {
                return Ok(Vec::new());
            }
        }
        let route = route_dates(start, end, tier.buffer.front_date());
        debug!(route = ?route, start = ?start, end = ?end, "date query");
        match route {
            DateRoute::Backend => self.backend.rows_by_date(start, end),
            DateRoute::Buffer => Ok(tier.buffer.between(start, end)),
            DateRoute::Split { pivot } => {
                let mut rows = self.backend.rows_by_date(start, Some(pivot))?;
                rows.extend(tier.buffer.between(Some(pivot), end));
                // Disk rows come first, so a repeated date keeps the disk copy.
                rows.dedup_by_key(|c| c.date);
                Ok(rows)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Size & shape
    // -------------------------------------------------------------------------

    pub fn len(&self) -> usize {
        self.tier.read().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn buffered_len(&self) -> usize {
        self.tier.read().buffer.len()
    }

    pub fn persisted_len(&self) -> usize {
        self.tier.read().persisted
    }

    pub fn flush_boundary(&self) -> Option<FlushBoundary> {
        let tier = self.tier.read();
        tier.boundary.map(|date| FlushBoundary {
            date,
            persisted: tier.persisted,
        })
    }

    pub fn min_date(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let tier = self.tier.read();
        self.min_date_locked(&tier)
    }

    pub fn max_date(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let tier = self.tier.read();
        self.max_date_locked(&tier)
    }

    fn min_date_locked(&self, tier: &MemoryTier) -> StoreResult<Option<DateTime<Utc>>> {
        if tier.persisted > 0 {
            return self.backend.min_date();
        }
        Ok(tier.buffer.front_date())
    }

    fn max_date_locked(&self, tier: &MemoryTier) -> StoreResult<Option<DateTime<Utc>>> {
        if let Some(last) = tier.buffer.back_date() {
            return Ok(Some(last));
        }
        self.backend.max_date()
    }

    /// Gap heuristic: infers the sampling interval from the first two records
    /// and checks that the covered span holds exactly `len()` slots.
    ///
    /// This only says the series *could* be gap-free under uniform spacing.
    /// It cannot say where a gap is, and a missing record offset by an extra
    /// off-grid record elsewhere goes unnoticed.
    pub fn is_complete(&self) -> StoreResult<bool> {
        let tier = self.tier.read();
        if tier.len < 2 {
            return Ok(true);
        }

        let head = self.positions(&tier, 0..2)?;
        let [first, second] = head.as_slice() else {
            return Ok(false);
        };
        let interval = (second.date - first.date).num_seconds();
        if interval <= 0 {
            return Ok(false);
        }

        let (Some(min), Some(max)) = (self.min_date_locked(&tier)?, self.max_date_locked(&tier)?)
        else {
            return Ok(false);
        };
        let span = (max - min).num_seconds();
        Ok(span % interval == 0 && (span / interval) as usize + 1 == tier.len)
    }

    pub fn limits(&self) -> TierLimits {
        self.limits
    }

    pub fn backend(&self) -> &SqliteBackend {
        &self.backend
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{candle, ts};

    fn open_store(dir: &tempfile::TempDir, min_size: usize, max_size: usize) -> TieredCandleStore {
        let config = StoreConfig {
            db_path: dir.path().join("store.db").to_string_lossy().into_owned(),
            table: "eurusd".into(),
            min_size,
            max_size,
            ..StoreConfig::default()
        };
        TieredCandleStore::open(&config).unwrap()
    }

    fn minutes(range: std::ops::Range<i64>) -> Vec<CandleRecord> {
        range.map(|i| candle(i * 60, 100.0 + i as f64)).collect()
    }

    fn assert_len_invariant(store: &TieredCandleStore) {
        let on_disk = store.backend().count().unwrap();
        assert_eq!(store.persisted_len(), on_disk);
        assert_eq!(store.len(), on_disk + store.buffered_len());
    }

    fn assert_strictly_ascending(rows: &[CandleRecord]) {
        assert!(
            rows.windows(2).all(|w| w[0].date < w[1].date),
            "rows are not strictly ascending"
        );
    }

    #[test]
    fn three_thousand_minutes_split_across_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 2000, 2500);

        let outcome = store.append(minutes(0..3000)).unwrap();
        assert_eq!(outcome.added, 3000);
        assert_eq!(outcome.evicted, 1000);

        assert_eq!(store.len(), 3000);
        assert_eq!(store.buffered_len(), 2000);
        assert_eq!(store.backend().count().unwrap(), 1000);
        assert_eq!(store.record(0).unwrap(), candle(0, 100.0));
        assert_eq!(
            store.flush_boundary(),
            Some(FlushBoundary {
                date: ts(999 * 60),
                persisted: 1000
            })
        );
        assert_len_invariant(&store);
    }

    #[test]
    fn duplicate_date_in_one_batch_keeps_last() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 2, 4);
        let first = CandleRecord::new(ts(100), 1.0, 2.0, 3.0, 0.5);
        let second = CandleRecord::new(ts(100), 5.0, 6.0, 7.0, 4.0);

        store.append(vec![first, second]).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(ts(100)).unwrap(), vec![second]);
        assert_eq!(store.get(Query::all()).unwrap(), vec![second]);
    }

    #[test]
    fn duplicates_resolve_last_write_wins_across_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 2, 4);
        store.append(minutes(0..6)).unwrap();
        assert_eq!(store.persisted_len(), 4);
        assert_eq!(store.buffered_len(), 2);

        let on_disk = CandleRecord::new(ts(60), 9.0, 9.0, 9.0, 9.0);
        let outcome = store.append(vec![on_disk]).unwrap();
        assert_eq!(outcome.late, 1);
        assert_eq!(outcome.added, 0);

        let in_memory = CandleRecord::new(ts(300), 8.0, 8.0, 8.0, 8.0);
        store.append(vec![in_memory]).unwrap();

        assert_eq!(store.len(), 6);
        assert_eq!(store.record(1).unwrap(), on_disk);
        assert_eq!(store.record(5).unwrap(), in_memory);
        assert_len_invariant(&store);
    }

    #[test]
    fn late_record_before_boundary_goes_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 2, 4);
        store.append(minutes(10..16)).unwrap();
        let boundary = store.flush_boundary().unwrap();

        let outcome = store.append(vec![candle(0, 50.0)]).unwrap();
        assert_eq!(outcome.late, 1);
        assert_eq!(outcome.added, 1);
        assert_eq!(store.len(), 7);
        assert_eq!(store.record(0).unwrap(), candle(0, 50.0));
        assert_eq!(store.flush_boundary().unwrap().date, boundary.date);
        assert!(store.get(ts(0)).unwrap().len() == 1);
        assert_len_invariant(&store);
    }

    #[test]
    fn len_matches_tiers_after_every_append() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 5, 8);
        for round in 0..20_i64 {
            // Overlapping, reversed windows.
            let mut batch = minutes(round * 3..round * 3 + 6);
            batch.reverse();
            store.append(batch).unwrap();
            assert_len_invariant(&store);
        }
        assert_eq!(store.len(), 19 * 3 + 6);

        let all = store.get(..).unwrap();
        assert_eq!(all.len(), store.len());
        assert_strictly_ascending(&all);
    }

    #[test]
    fn index_before_boundary_matches_backend_position() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 10, 20);
        store.append(minutes(0..50)).unwrap();
        let persisted = store.persisted_len();
        assert!(persisted > 0);

        for i in 0..persisted {
            let direct = store.backend().rows_by_position(i, i + 1).unwrap();
            assert_eq!(store.get(i as i64).unwrap(), direct);
        }
    }

    #[test]
    fn slice_straddling_boundary_has_no_gap_or_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 10, 20);
        store.append(minutes(0..50)).unwrap();
        let p = store.persisted_len() as i64;

        let rows = store.get(Query::slice(p - 3, p + 3)).unwrap();
        let dates: Vec<i64> = rows.iter().map(|c| c.epoch() / 60).collect();
        assert_eq!(dates, ((p - 3)..(p + 3)).collect::<Vec<_>>());

        assert_eq!(store.get(Query::slice(p, p + 2)).unwrap().len(), 2);
        assert_eq!(store.get(Query::slice(0, 3)).unwrap(), minutes(0..3));
    }

    #[test]
    fn negative_and_out_of_range_indices() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 10, 20);
        store.append(minutes(0..30)).unwrap();

        assert_eq!(store.record(-1).unwrap(), candle(29 * 60, 129.0));
        assert_eq!(store.record(-30).unwrap(), candle(0, 100.0));
        assert!(matches!(
            store.record(30),
            Err(StoreError::IndexOutOfRange { index: 30, len: 30 })
        ));
        assert!(store.record(-31).is_err());
        assert!(store.get(Query::slice(0, 31)).is_err());
        assert_eq!(store.get(-3_i64..).unwrap(), minutes(27..30));
        assert!(store.get(Query::slice(5, 2)).unwrap().is_empty());
    }

    #[test]
    fn empty_store_queries_return_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 2, 4);
        assert!(store.get(0_i64).unwrap().is_empty());
        assert!(store.get(..).unwrap().is_empty());
        assert!(store.get("2024-03").unwrap().is_empty());
        assert!(store.get(ts(0)).unwrap().is_empty());
        assert_eq!(store.min_date().unwrap(), None);
        assert_eq!(store.max_date().unwrap(), None);
        assert!(store.record(0).is_err());
        assert!(matches!(store.get("not-a-period"), Err(StoreError::InvalidPeriod(_))));
    }

    #[test]
    fn period_and_date_queries_route_across_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 30, 50);
        // Hourly candles from 2024-02-28 00:00 UTC for four days.
        let start = 1_709_078_400;
        let hourly: Vec<CandleRecord> =
            (0..96).map(|h| candle(start + h * 3600, 1.0 + h as f64)).collect();
        store.append(hourly.clone()).unwrap();
        assert_eq!(store.persisted_len(), 66);

        // Disk only.
        let feb = store.get("2024-02").unwrap();
        assert_eq!(feb, hourly[..48].to_vec());
        // Straddles the boundary.
        let march = store.get("2024-03").unwrap();
        assert_eq!(march, hourly[48..].to_vec());
        // Memory only.
        let second = store.get("2024-03-02").unwrap();
        assert_eq!(second, hourly[72..].to_vec());

        let window = store
            .get(Query::dates(hourly[60].date, hourly[70].date))
            .unwrap();
        assert_eq!(window, hourly[60..70].to_vec());
        assert_eq!(store.get(..hourly[2].date).unwrap(), hourly[..2].to_vec());
        assert_eq!(
            store.get("2024-02-29".."2024-03-02").unwrap(),
            hourly[24..72].to_vec()
        );
        assert_eq!(
            store.get("2024-03-02 12:00:00"..).unwrap(),
            hourly[84..].to_vec()
        );
        assert!(matches!(
            store.get("2024-02-29".."later"),
            Err(StoreError::InvalidPeriod(_))
        ));

        assert_eq!(store.get(hourly[10].date).unwrap(), vec![hourly[10]]);
        assert_eq!(store.get(hourly[90].date).unwrap(), vec![hourly[90]]);
        assert_eq!(store.min_date().unwrap(), Some(hourly[0].date));
        assert_eq!(store.max_date().unwrap(), Some(hourly[95].date));
    }

    #[test]
    fn completeness_heuristic() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 10, 20);
        assert!(store.is_complete().unwrap());

        store.append(minutes(0..100)).unwrap();
        assert!(store.is_complete().unwrap());

        let gappy_dir = tempfile::tempdir().unwrap();
        let gappy = open_store(&gappy_dir, 10, 20);
        let mut series = minutes(0..100);
        series.remove(50);
        gappy.append(series).unwrap();
        assert!(!gappy.is_complete().unwrap());
    }

    #[test]
    fn clear_empties_both_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 5, 10);
        store.append(minutes(0..40)).unwrap();
        store.clear().unwrap();

        assert_eq!(store.len(), 0);
        assert!(store.get(..).unwrap().is_empty());
        assert_eq!(store.backend().count().unwrap(), 0);
        assert_eq!(store.flush_boundary(), None);

        store.append(minutes(0..3)).unwrap();
        assert_eq!(store.len(), 3);
        assert_len_invariant(&store);
    }

    #[test]
    fn malformed_batch_is_refused_whole() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 2, 4);
        store.append(minutes(0..2)).unwrap();

        let mut bad = candle(600, 1.0);
        bad.high = 0.0;
        let err = store.append(vec![candle(120, 1.0), bad]).unwrap_err();
        assert!(matches!(err, StoreError::Malformed { .. }));
        assert_eq!(store.len(), 2);
        assert!(store.get(ts(120)).unwrap().is_empty());
    }

    #[test]
    fn failed_eviction_keeps_buffer_intact() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 2, 4);
        store.append(minutes(0..4)).unwrap();
        assert_eq!(store.persisted_len(), 0);

        store
            .backend()
            .pool()
            .with_conn(|c| Ok(c.execute_batch("DROP TABLE eurusd")?))
            .unwrap();

        assert!(store.append(minutes(4..6)).is_err());
        assert_eq!(store.buffered_len(), 6);
        assert_eq!(store.len(), 6);
        assert_eq!(store.get(..).unwrap(), minutes(0..6));

        store.clear().unwrap();
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn eviction_retries_once_backend_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 2, 4);
        store.append(minutes(0..4)).unwrap();
        store
            .backend()
            .pool()
            .with_conn(|c| Ok(c.execute_batch("DROP TABLE eurusd")?))
            .unwrap();
        assert!(store.append(minutes(4..6)).is_err());
        assert_eq!(store.len(), 6);

        store.backend().drop_and_recreate().unwrap();
        assert_eq!(store.free().unwrap(), 4);

        assert_eq!(store.backend().rows_by_date(None, None).unwrap(), minutes(0..4));
        assert_eq!(store.buffered_len(), 2);
        assert_eq!(store.len(), 6);
        assert_eq!(store.flush_boundary().unwrap().date, ts(3 * 60));
        assert_eq!(store.get(..).unwrap(), minutes(0..6));
        assert_len_invariant(&store);
    }

    #[test]
    fn sub_second_dates_are_refused_and_flush_keeps_len() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 0, 10);
        let at_ms = |ms: i64| {
            let mut c = candle(100, 1.0);
            c.date = ts(0) + chrono::Duration::milliseconds(ms);
            c
        };

        let err = store.append(vec![at_ms(100_200), at_ms(100_700)]).unwrap_err();
        assert!(matches!(err, StoreError::Malformed { .. }));
        assert_eq!(store.len(), 0);

        store.append(vec![candle(100, 1.0), candle(101, 2.0)]).unwrap();
        assert_eq!(store.flush().unwrap(), 2);
        assert_eq!(store.len(), 2);
        assert_len_invariant(&store);
        assert_eq!(store.get(ts(100)).unwrap(), vec![candle(100, 1.0)]);
        assert!(store.append(vec![at_ms(100_900)]).is_err());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn flush_then_reopen_resumes_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(&dir, 5, 10);
            store.append(minutes(0..25)).unwrap();
            assert_eq!(store.flush().unwrap(), 5);
            assert_eq!(store.buffered_len(), 0);
        }

        let store = open_store(&dir, 5, 10);
        assert_eq!(store.len(), 25);
        assert_eq!(store.flush_boundary().unwrap().date, ts(24 * 60));
        assert_eq!(store.record(-1).unwrap(), candle(24 * 60, 124.0));

        store.append(minutes(25..27)).unwrap();
        assert_eq!(store.len(), 27);
        assert!(store.is_complete().unwrap());
    }

    #[test]
    fn aggregated_buckets_and_matrix_rows_ingest() {
        use crate::aggregator::{Bucket, CandleAggregator};
        use crate::ingest;

        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 3, 6);

        let mut closed = Vec::new();
        let mut agg = CandleAggregator::new(5, |b: &Bucket, _| closed.push(b.clone())).unwrap();
        let base = 1_700_000_040;
        for i in 0..=40 {
            agg.add_value(10.0 + (i % 7) as f64, ts(base + i));
        }
        drop(agg);
        assert_eq!(closed.len(), 8);

        store.append(ingest::from_buckets(&closed)).unwrap();
        assert_eq!(store.len(), 8);
        assert!(store.is_complete().unwrap());
        assert_eq!(store.record(0).unwrap().date, ts(base));

        let matrix = vec![vec![(base + 40) as f64, 1.0, 2.0, 2.5, 0.5]];
        store.append(ingest::from_matrix(&matrix).unwrap()).unwrap();
        assert_eq!(store.len(), 9);
        assert!(store.is_complete().unwrap());
        assert_len_invariant(&store);
    }

    #[test]
    fn free_is_a_no_op_within_limits() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 2, 4);
        store.append(minutes(0..4)).unwrap();
        assert_eq!(store.free().unwrap(), 0);
        assert_eq!(store.buffered_len(), 4);
    }

    #[test]
    fn readers_on_other_threads_see_consistent_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 20, 40);

        std::thread::scope(|s| {
            for _ in 0..3 {
                s.spawn(|| {
                    for _ in 0..50 {
                        let rows = store.get(..).unwrap();
                        assert_strictly_ascending(&rows);
                        if let Some(first) = rows.first() {
                            assert_eq!(first.epoch(), 0);
                        }
                    }
                    store.backend().pool().release_current_thread();
                });
            }
            for chunk in 0..30_i64 {
                store.append(minutes(chunk * 10..chunk * 10 + 10)).unwrap();
            }
        });

        assert_eq!(store.len(), 300);
        assert_len_invariant(&store);
    }
}
