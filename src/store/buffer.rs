use std::collections::{BTreeMap, VecDeque};
use std::ops::Range;

use chrono::{DateTime, Utc};

use crate::types::CandleRecord;

// ---------------------------------------------------------------------------
// CandleBuffer -- date-ordered in-memory tier
// ---------------------------------------------------------------------------

/// Newest candles of a store, ascending by date with at most one record per
/// date. Not synchronised on its own; the owning store guards it.
#[derive(Debug, Default)]
pub struct CandleBuffer {
    ring: VecDeque<CandleRecord>,
}

impl CandleBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `incoming` into the buffer. A date already present, or repeated
    /// within `incoming`, keeps the value that arrived last.
    ///
    /// Returns how many new dates were added.
    pub fn merge(&mut self, incoming: Vec<CandleRecord>) -> usize {
        if incoming.is_empty() {
            return 0;
        }
        let before = self.ring.len();

        // Fast path: a strictly ascending batch entirely after the newest date.
        let appends_in_order = incoming.windows(2).all(|w| w[0].date < w[1].date)
            && self.back_date().map_or(true, |last| incoming[0].date > last);
        if appends_in_order {
            self.ring.extend(incoming);
            return self.ring.len() - before;
        }

        let mut merged: BTreeMap<DateTime<Utc>, CandleRecord> =
            self.ring.drain(..).map(|c| (c.date, c)).collect();
        for candle in incoming {
            merged.insert(candle.date, candle);
        }
        self.ring = merged.into_values().collect();
        self.ring.len() - before
    }

    /// Copies of the `n` oldest records.
    pub fn oldest(&self, n: usize) -> Vec<CandleRecord> {
        self.ring.iter().take(n).copied().collect()
    }

    /// Trim the `n` oldest records.
    pub fn drop_oldest(&mut self, n: usize) {
        let n = n.min(self.ring.len());
        self.ring.drain(..n);
    }

    /// Records at buffer offsets `range`. The caller has bounds-checked it.
    pub fn slice(&self, range: Range<usize>) -> Vec<CandleRecord> {
        self.ring.range(range).copied().collect()
    }

    /// Records with `start <= date < end`; open bounds are unbounded.
    pub fn between(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Vec<CandleRecord> {
        let lo = start.map_or(0, |s| self.ring.partition_point(|c| c.date < s));
        let hi = end.map_or(self.ring.len(), |e| self.ring.partition_point(|c| c.date < e));
        if lo >= hi {
            return Vec::new();
        }
        self.slice(lo..hi)
    }

    pub fn at(&self, date: DateTime<Utc>) -> Option<CandleRecord> {
        let pos = self.ring.partition_point(|c| c.date < date);
        self.ring.get(pos).filter(|c| c.date == date).copied()
    }

    pub fn front_date(&self) -> Option<DateTime<Utc>> {
        self.ring.front().map(|c| c.date)
    }

    pub fn back_date(&self) -> Option<DateTime<Utc>> {
        self.ring.back().map(|c| c.date)
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn clear(&mut self) {
        self.ring.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
