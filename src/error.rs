// =============================================================================
// Store errors
// =============================================================================

use thiserror::Error;

/// Every failure the storage layer can surface to a caller.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A record in an ingest batch failed validation. The batch was not applied.
    #[error("malformed record: {reason}")]
    Malformed { reason: String },

    /// A logical index (or slice endpoint) fell outside the store after
    /// negative-index wrapping.
    #[error("index {index} out of range for store of length {len}")]
    IndexOutOfRange { index: i64, len: usize },

    /// A calendar-period key could not be parsed.
    #[error("invalid period key: {0:?}")]
    InvalidPeriod(String),

    /// A table name that cannot safely be used as an SQL identifier.
    #[error("invalid table name: {0:?}")]
    InvalidTable(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Anything raised by SQLite: open failures, I/O, constraint violations.
    #[error("backend error: {0}")]
    Backend(#[from] rusqlite::Error),
}

impl StoreError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
