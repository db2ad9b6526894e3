// =============================================================================
// Ingest Adapters — external batch shapes into `Vec<CandleRecord>`
// =============================================================================
//
// The store only accepts the canonical record type. Each supported producer
// shape gets an explicit adapter here; anything that cannot be converted is
// reported as a malformed record and the whole batch is refused.
// =============================================================================

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::aggregator::Bucket;
use crate::error::{StoreError, StoreResult};
use crate::types::{from_epoch, CandleRecord};

/// Column order of a raw numeric matrix row.
pub const MATRIX_COLUMNS: [&str; 5] = ["date", "open", "close", "high", "low"];

/// Date cell of a tabular row: epoch seconds or a textual timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RowDate {
    Epoch(i64),
    Text(String),
}

impl RowDate {
    fn to_utc(&self) -> StoreResult<DateTime<Utc>> {
        match self {
            Self::Epoch(secs) => from_epoch(*secs),
            Self::Text(text) => parse_text_date(text),
        }
    }
}

/// One already-tabular row, as produced by CSV/JSON tooling upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleRow {
    pub date: RowDate,
    pub open: f64,
    pub close: f64,
    pub high: f64,
    pub low: f64,
}

/// Accepts RFC 3339 (`2024-03-01T10:00:00Z`), a naive `YYYY-MM-DD HH:MM:SS`
/// or a bare `YYYY-MM-DD` (midnight). Naive forms are read as UTC.
pub(crate) fn parse_text_date(text: &str) -> StoreResult<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
        .ok_or_else(|| StoreError::malformed(format!("unparseable date {text:?}")))
}

/// Closed aggregator buckets, each dated at its start time.
pub fn from_buckets(buckets: &[Bucket]) -> Vec<CandleRecord> {
    buckets.iter().map(Bucket::to_record).collect()
}

pub fn from_rows(rows: &[CandleRow]) -> StoreResult<Vec<CandleRecord>> {
    rows.iter()
        .map(|row| {
            Ok(CandleRecord::new(
                row.date.to_utc()?,
                row.open,
                row.close,
                row.high,
                row.low,
            ))
        })
        .collect()
}

/// Parse a JSON array of [`CandleRow`] objects.
pub fn from_json_rows(json: &str) -> StoreResult<Vec<CandleRecord>> {
    let rows: Vec<CandleRow> = serde_json::from_str(json)
        .map_err(|e| StoreError::malformed(format!("invalid row batch: {e}")))?;
    from_rows(&rows)
}

/// Raw numeric rows in [`MATRIX_COLUMNS`] order, date as epoch seconds.
pub fn from_matrix(matrix: &[Vec<f64>]) -> StoreResult<Vec<CandleRecord>> {
    matrix
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let [date, open, close, high, low] = row.as_slice() else {
                return Err(StoreError::malformed(format!(
                    "matrix row {i} has {} columns, expected {}",
                    row.len(),
                    MATRIX_COLUMNS.len()
                )));
            };
            if !date.is_finite() || date.fract() != 0.0 {
                return Err(StoreError::malformed(format!(
                    "matrix row {i} has non-integral date {date}"
                )));
            }
            Ok(CandleRecord::new(from_epoch(*date as i64)?, *open, *close, *high, *low))
        })
        .collect()
}
