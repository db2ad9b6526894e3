// =============================================================================
// Shared types used across the candle store
// =============================================================================

use chrono::{DateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// A single OHLC candle. `date` is the dedup key across both storage tiers and
/// carries whole seconds only, matching its on-disk epoch form.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CandleRecord {
    pub date: DateTime<Utc>,
    pub open: f64,
    pub close: f64,
    pub high: f64,
    pub low: f64,
}

impl CandleRecord {
    pub fn new(date: DateTime<Utc>, open: f64, close: f64, high: f64, low: f64) -> Self {
        Self {
            date,
            open,
            close,
            high,
            low,
        }
    }

    /// Reject sub-second dates, non-finite prices and inconsistent high/low
    /// bounds.
    pub fn validate(&self) -> StoreResult<()> {
        if self.date.nanosecond() != 0 {
            return Err(StoreError::malformed(format!(
                "date {} has a sub-second part",
                self.date
            )));
        }

        let fields = [
            ("open", self.open),
            ("close", self.close),
            ("high", self.high),
            ("low", self.low),
        ];
        if let Some((name, value)) = fields.iter().find(|(_, v)| !v.is_finite()) {
            return Err(StoreError::malformed(format!(
                "{name} is not a finite number ({value}) at {}",
                self.date
            )));
        }

        if self.high < self.open.max(self.close).max(self.low) {
            return Err(StoreError::malformed(format!(
                "high {} is below open/close/low at {}",
                self.high, self.date
            )));
        }
        if self.low > self.open.min(self.close).min(self.high) {
            return Err(StoreError::malformed(format!(
                "low {} is above open/close/high at {}",
                self.low, self.date
            )));
        }
        Ok(())
    }

    /// Seconds since the Unix epoch, the on-disk representation of `date`.
    pub fn epoch(&self) -> i64 {
        self.date.timestamp()
    }
}

/// Convert epoch seconds into a UTC timestamp.
pub fn from_epoch(secs: i64) -> StoreResult<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| StoreError::malformed(format!("epoch {secs} is out of range")))
}

/// Physical layout of the backing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableLayout {
    /// `date, open, close, high, low` with a unique index on `date`.
    Standard,
    /// Standard columns plus an explicit `idx INTEGER PRIMARY KEY` surrogate.
    Legacy,
}

impl Default for TableLayout {
    fn default() -> Self {
        Self::Standard
    }
}

impl std::fmt::Display for TableLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Standard => write!(f, "Standard"),
            Self::Legacy => write!(f, "Legacy"),
        }
    }
}

#[cfg(test)]
pub(crate) fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

/// Flat candle at `secs` around `price`, used throughout the test modules.
#[cfg(test)]
pub(crate) fn candle(secs: i64, price: f64) -> CandleRecord {
    CandleRecord::new(ts(secs), price, price + 0.5, price + 1.0, price - 1.0)
}
