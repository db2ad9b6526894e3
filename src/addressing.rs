// =============================================================================
// Addressing — query keys and their translation onto the two storage tiers
// =============================================================================
//
// A store can be addressed three ways: by logical position (index or slice),
// by date range, or by calendar period. Positions run over the persisted rows
// in date order followed by the buffered rows, so the persisted count is the
// only thing needed to split a position range between the tiers. Date ranges
// split at the earliest buffered date.
// =============================================================================

use std::ops::{Range, RangeFrom, RangeFull, RangeTo};

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};

use crate::error::{StoreError, StoreResult};
use crate::ingest::parse_text_date;

/// A key accepted by [`TieredCandleStore::get`](crate::store::TieredCandleStore::get).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    /// One logical position; negative values count from the end.
    Index(i64),
    /// Half-open position range. `None` means "from the start" / "to the end".
    Slice { start: Option<i64>, end: Option<i64> },
    /// Calendar period such as `"2024"`, `"2024Q1"`, `"2024-03"` or `"2024-03-15"`.
    Period(String),
    /// Half-open date range.
    Dates {
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    },
    /// Half-open date range with textual endpoints such as `"2017-01-01"` or
    /// `"2017-01-01 09:30:00"`, parsed when the query runs.
    DateText {
        start: Option<String>,
        end: Option<String>,
    },
    /// The record at exactly this timestamp.
    At(DateTime<Utc>),
}

impl Query {
    pub fn index(i: i64) -> Self {
        Self::Index(i)
    }

    pub fn slice(start: i64, end: i64) -> Self {
        Self::Slice {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn dates(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self::Dates {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn all() -> Self {
        Self::Slice {
            start: None,
            end: None,
        }
    }
}

impl From<i64> for Query {
    fn from(i: i64) -> Self {
        Self::Index(i)
    }
}

impl From<Range<i64>> for Query {
    fn from(r: Range<i64>) -> Self {
        Self::slice(r.start, r.end)
    }
}

impl From<RangeFrom<i64>> for Query {
    fn from(r: RangeFrom<i64>) -> Self {
        Self::Slice {
            start: Some(r.start),
            end: None,
        }
    }
}

impl From<RangeTo<i64>> for Query {
    fn from(r: RangeTo<i64>) -> Self {
        Self::Slice {
            start: None,
            end: Some(r.end),
        }
    }
}

impl From<RangeFull> for Query {
    fn from(_: RangeFull) -> Self {
        Self::all()
    }
}

impl From<&str> for Query {
    fn from(s: &str) -> Self {
        Self::Period(s.to_string())
    }
}

impl From<String> for Query {
    fn from(s: String) -> Self {
        Self::Period(s)
    }
}

impl From<Range<DateTime<Utc>>> for Query {
    fn from(r: Range<DateTime<Utc>>) -> Self {
        Self::dates(r.start, r.end)
    }
}

impl From<RangeFrom<DateTime<Utc>>> for Query {
    fn from(r: RangeFrom<DateTime<Utc>>) -> Self {
        Self::Dates {
            start: Some(r.start),
            end: None,
        }
    }
}

impl From<RangeTo<DateTime<Utc>>> for Query {
    fn from(r: RangeTo<DateTime<Utc>>) -> Self {
        Self::Dates {
            start: None,
            end: Some(r.end),
        }
    }
}

impl From<Range<&str>> for Query {
    fn from(r: Range<&str>) -> Self {
        Self::DateText {
            start: Some(r.start.to_string()),
            end: Some(r.end.to_string()),
        }
    }
}

impl From<RangeFrom<&str>> for Query {
    fn from(r: RangeFrom<&str>) -> Self {
        Self::DateText {
            start: Some(r.start.to_string()),
            end: None,
        }
    }
}

impl From<RangeTo<&str>> for Query {
    fn from(r: RangeTo<&str>) -> Self {
        Self::DateText {
            start: None,
            end: Some(r.end.to_string()),
        }
    }
}

impl From<DateTime<Utc>> for Query {
    fn from(d: DateTime<Utc>) -> Self {
        Self::At(d)
    }
}

/// Parse the textual endpoints of a [`Query::DateText`].
pub(crate) fn resolve_date_text(
    start: Option<&str>,
    end: Option<&str>,
) -> StoreResult<(Option<DateTime<Utc>>, Option<DateTime<Utc>>)> {
    let parse = |text: &str| {
        parse_text_date(text).map_err(|_| StoreError::InvalidPeriod(text.to_string()))
    };
    Ok((start.map(parse).transpose()?, end.map(parse).transpose()?))
}

// =============================================================================
// Calendar periods
// =============================================================================

/// Parse a calendar-period key into its half-open `[start, end)` span.
///
/// Accepted forms: `YYYY`, `YYYYQn`, `YYYY-MM`, `YYYY-MM-DD`,
/// `YYYY-MM-DD HH` and `YYYY-MM-DD HH:MM`.
pub fn parse_period(key: &str) -> StoreResult<(DateTime<Utc>, DateTime<Utc>)> {
    let key = key.trim();
    let invalid = || StoreError::InvalidPeriod(key.to_string());

    if let Some((day, time)) = key.split_once(' ') {
        let day = NaiveDate::parse_from_str(day, "%Y-%m-%d").map_err(|_| invalid())?;
        let (hour, minute, step) = match time.split_once(':') {
            Some((h, m)) => (
                number(h).ok_or_else(invalid)?,
                number(m).ok_or_else(invalid)?,
                Duration::minutes(1),
            ),
            None => (number(time).ok_or_else(invalid)?, 0, Duration::hours(1)),
        };
        let start = day.and_hms_opt(hour, minute, 0).ok_or_else(invalid)?;
        return Ok(utc_span(start, start + step));
    }

    if let Some((year, quarter)) = key.split_once(|c: char| c == 'Q' || c == 'q') {
        let year = year_number(year).ok_or_else(invalid)?;
        let quarter = number(quarter).filter(|q| (1..=4).contains(q)).ok_or_else(invalid)?;
        let start = NaiveDate::from_ymd_opt(year, (quarter - 1) * 3 + 1, 1).ok_or_else(invalid)?;
        let end = add_months(start, 3).ok_or_else(invalid)?;
        return Ok(utc_day_span(start, end));
    }

    let parts: Vec<&str> = key.split('-').collect();
    match parts.as_slice() {
        [year] => {
            let year = year_number(year).ok_or_else(invalid)?;
            let start = NaiveDate::from_ymd_opt(year, 1, 1).ok_or_else(invalid)?;
            let end = NaiveDate::from_ymd_opt(year + 1, 1, 1).ok_or_else(invalid)?;
            Ok(utc_day_span(start, end))
        }
        [year, month] => {
            let year = year_number(year).ok_or_else(invalid)?;
            let month = number(month).ok_or_else(invalid)?;
            let start = NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(invalid)?;
            let end = add_months(start, 1).ok_or_else(invalid)?;
            Ok(utc_day_span(start, end))
        }
        [_, _, _] => {
            let start = NaiveDate::parse_from_str(key, "%Y-%m-%d").map_err(|_| invalid())?;
            let end = start.succ_opt().ok_or_else(invalid)?;
            Ok(utc_day_span(start, end))
        }
        _ => Err(invalid()),
    }
}

fn number(s: &str) -> Option<u32> {
    if s.is_empty() || !s.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn year_number(s: &str) -> Option<i32> {
    if s.len() != 4 {
        return None;
    }
    number(s).map(|y| y as i32)
}

fn add_months(date: NaiveDate, months: u32) -> Option<NaiveDate> {
    let total = date.month0() + months;
    NaiveDate::from_ymd_opt(date.year() + (total / 12) as i32, total % 12 + 1, 1)
}

fn utc_span(start: NaiveDateTime, end: NaiveDateTime) -> (DateTime<Utc>, DateTime<Utc>) {
    (Utc.from_utc_datetime(&start), Utc.from_utc_datetime(&end))
}

fn utc_day_span(start: NaiveDate, end: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    utc_span(start.and_time(chrono::NaiveTime::MIN), end.and_time(chrono::NaiveTime::MIN))
}

// =============================================================================
// Positions
// =============================================================================

/// Wrap a negative position once and require it to address an existing row.
pub(crate) fn resolve_index(index: i64, len: usize) -> StoreResult<usize> {
    let wrapped = if index < 0 { index + len as i64 } else { index };
    if wrapped < 0 || wrapped >= len as i64 {
        return Err(StoreError::IndexOutOfRange { index, len });
    }
    Ok(wrapped as usize)
}

/// Like [`resolve_index`] but for a slice endpoint, which may equal `len`.
fn resolve_bound(bound: i64, len: usize) -> StoreResult<usize> {
    let wrapped = if bound < 0 { bound + len as i64 } else { bound };
    if wrapped < 0 || wrapped > len as i64 {
        return Err(StoreError::IndexOutOfRange { index: bound, len });
    }
    Ok(wrapped as usize)
}

/// Resolve slice endpoints to a position range. An inverted range is empty.
pub(crate) fn resolve_slice(
    start: Option<i64>,
    end: Option<i64>,
    len: usize,
) -> StoreResult<Range<usize>> {
    let start = start.map_or(Ok(0), |s| resolve_bound(s, len))?;
    let end = end.map_or(Ok(len), |e| resolve_bound(e, len))?;
    Ok(start..end.max(start))
}

/// Where a position range lives, given `persisted` rows on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PositionRoute {
    Backend(Range<usize>),
    /// Offsets into the buffer.
    Buffer(Range<usize>),
    Split {
        backend: Range<usize>,
        buffer: Range<usize>,
    },
}

pub(crate) fn route_positions(range: Range<usize>, persisted: usize) -> PositionRoute {
    if range.start >= persisted {
        PositionRoute::Buffer(range.start - persisted..range.end - persisted)
    } else if range.end <= persisted {
        PositionRoute::Backend(range)
    } else {
        PositionRoute::Split {
            backend: range.start..persisted,
            buffer: 0..range.end - persisted,
        }
    }
}

/// Where a date range lives, given the earliest buffered date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DateRoute {
    Backend,
    Buffer,
    /// Backend for `[start, pivot)`, buffer for `[pivot, end)`.
    Split { pivot: DateTime<Utc> },
}

pub(crate) fn route_dates(
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    earliest_buffered: Option<DateTime<Utc>>,
) -> DateRoute {
    let Some(pivot) = earliest_buffered else {
        return DateRoute::Backend;
    };
    if end.is_some_and(|e| e <= pivot) {
        DateRoute::Backend
    } else if start.is_some_and(|s| s >= pivot) {
        DateRoute::Buffer
    } else {
        DateRoute::Split { pivot }
    }
}
