// =============================================================================
// Candle Aggregator — folds price samples into fixed-duration OHLC buckets
// =============================================================================
//
// Buckets are aligned to the wall clock: a bucket opens on a sample whose
// second-of-minute is a multiple of `duration`, and closes on the next aligned
// sample. The closing sample also opens the following bucket, so consecutive
// candles share their boundary price.
//
// Delivery must be monotonic and gap-free; sparse or out-of-order samples
// produce undefined bucket boundaries.
// =============================================================================

use chrono::{DateTime, SubsecRound, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::types::CandleRecord;

/// In-progress aggregation state for one candle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub open: f64,
    pub close: f64,
    pub high: f64,
    pub low: f64,
    /// Whole second of the sample that opened the bucket.
    pub start_time: DateTime<Utc>,
    /// Bucket width in seconds.
    pub duration: u32,
    pub last_value: (f64, DateTime<Utc>),
}

impl Bucket {
    fn start(value: f64, timestamp: DateTime<Utc>, duration: u32) -> Self {
        Self {
            open: value,
            close: value,
            high: value,
            low: value,
            start_time: timestamp.trunc_subsecs(0),
            duration,
            last_value: (value, timestamp),
        }
    }

    fn update(&mut self, value: f64, timestamp: DateTime<Utc>) {
        self.high = self.high.max(value);
        self.low = self.low.min(value);
        self.close = value;
        self.last_value = (value, timestamp);
    }

    /// The candle this bucket represents, dated at its start time.
    pub fn to_record(&self) -> CandleRecord {
        CandleRecord::new(self.start_time, self.open, self.close, self.high, self.low)
    }
}

#[derive(Debug)]
enum BucketState {
    Idle,
    Open(Bucket),
}

/// Folds `(value, timestamp)` samples into buckets and hands every closed
/// bucket to `on_close`.
pub struct CandleAggregator<F>
where
    F: FnMut(&Bucket, (f64, DateTime<Utc>)),
{
    duration: u32,
    state: BucketState,
    on_close: F,
}

impl<F> CandleAggregator<F>
where
    F: FnMut(&Bucket, (f64, DateTime<Utc>)),
{
    /// `duration` is in seconds and must divide a minute evenly.
    pub fn new(duration: u32, on_close: F) -> StoreResult<Self> {
        if duration == 0 || duration > 60 || 60 % duration != 0 {
            return Err(StoreError::InvalidConfig(format!(
                "candle duration {duration}s does not divide 60"
            )));
        }
        Ok(Self {
            duration,
            state: BucketState::Idle,
            on_close,
        })
    }

    /// Feed one sample. Returns `false` when this sample closed (and emitted)
    /// a bucket, `true` otherwise.
    pub fn add_value(&mut self, value: f64, timestamp: DateTime<Utc>) -> bool {
        let aligned = timestamp.second() % self.duration == 0;

        match &mut self.state {
            BucketState::Idle => {
                if aligned {
                    self.state = BucketState::Open(Bucket::start(value, timestamp, self.duration));
                }
                true
            }
            BucketState::Open(bucket) => {
                bucket.update(value, timestamp);
                let elapsed = (timestamp - bucket.start_time).num_seconds();
                if !(aligned && elapsed > 0) {
                    return true;
                }

                bucket.close = value;
                debug!(
                    start = %bucket.start_time,
                    open = bucket.open,
                    close = bucket.close,
                    "bucket closed"
                );
                (self.on_close)(bucket, (value, timestamp));
                self.state = BucketState::Open(Bucket::start(value, timestamp, self.duration));
                false
            }
        }
    }

    /// The bucket currently accumulating, if one has opened.
    pub fn current(&self) -> Option<&Bucket> {
        match &self.state {
            BucketState::Idle => None,
            BucketState::Open(bucket) => Some(bucket),
        }
    }

    pub fn duration(&self) -> u32 {
        self.duration
    }
}
