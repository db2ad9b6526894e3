// =============================================================================
// candle-store — tiered OHLC candle storage
// =============================================================================
//
// A bounded in-memory buffer of the newest candles in front of a durable
// SQLite table, with one query surface over both.
//
//   aggregator  samples -> fixed-duration buckets
//   ingest      producer batch shapes -> Vec<CandleRecord>
//   store       buffer + eviction + query routing
//   backend     SQLite table and per-thread connections
//   addressing  index / slice / period / date-range keys
// =============================================================================

pub mod addressing;
pub mod aggregator;
pub mod backend;
pub mod config;
pub mod error;
pub mod ingest;
pub mod store;
pub mod types;

pub use addressing::Query;
pub use aggregator::{Bucket, CandleAggregator};
pub use backend::{ConnectionPool, SqliteBackend, UpsertOutcome};
pub use config::{StoreConfig, TierLimits};
pub use error::{StoreError, StoreResult};
pub use store::{AppendOutcome, FlushBoundary, TieredCandleStore};
pub use types::{CandleRecord, TableLayout};
