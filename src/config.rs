// =============================================================================
// Store Configuration — sizing, database location and SQLite tuning
// =============================================================================
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::aggregator::{Bucket, CandleAggregator};
use crate::backend::valid_table_name;
use crate::error::{StoreError, StoreResult};
use crate::types::TableLayout;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_db_path() -> String {
    "candles.db".to_string()
}

fn default_table() -> String {
    "stock".to_string()
}

fn default_max_size() -> usize {
    5000
}

fn default_min_size() -> usize {
    2000
}

fn default_journal_mode() -> String {
    "WAL".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_candle_duration_secs() -> u32 {
    60
}

// =============================================================================
// TierLimits
// =============================================================================

/// Bounds on the in-memory buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    /// Records kept in memory after an eviction pass.
    pub min_size: usize,
    /// Buffer length above which eviction runs.
    pub max_size: usize,
}

impl TierLimits {
    pub fn new(min_size: usize, max_size: usize) -> StoreResult<Self> {
        let limits = Self { min_size, max_size };
        limits.validate()?;
        Ok(limits)
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.max_size == 0 {
            return Err(StoreError::InvalidConfig("max_size must be at least 1".into()));
        }
        if self.min_size > self.max_size {
            return Err(StoreError::InvalidConfig(format!(
                "min_size {} exceeds max_size {}",
                self.min_size, self.max_size
            )));
        }
        Ok(())
    }
}

impl Default for TierLimits {
    fn default() -> Self {
        Self {
            min_size: default_min_size(),
            max_size: default_max_size(),
        }
    }
}

// =============================================================================
// StoreConfig
// =============================================================================

/// Top-level configuration for a tiered candle store.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    // --- Location -----------------------------------------------------------

    /// SQLite file backing the store. `":memory:"` keeps everything in RAM.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// One table per instrument.
    #[serde(default = "default_table")]
    pub table: String,

    #[serde(default)]
    pub layout: TableLayout,

    // --- Buffer sizing ------------------------------------------------------

    /// Buffer length above which the oldest records are flushed to disk.
    #[serde(default = "default_max_size")]
    pub max_size: usize,

    /// Records kept in memory after a flush.
    #[serde(default = "default_min_size")]
    pub min_size: usize,

    // --- SQLite tuning ------------------------------------------------------

    #[serde(default = "default_journal_mode")]
    pub journal_mode: String,

    /// How long a connection waits on a locked database before failing.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    // --- Aggregation --------------------------------------------------------

    /// Width of candles produced by the aggregator, in seconds.
    #[serde(default = "default_candle_duration_secs")]
    pub candle_duration_secs: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            table: default_table(),
            layout: TableLayout::default(),
            max_size: default_max_size(),
            min_size: default_min_size(),
            journal_mode: default_journal_mode(),
            busy_timeout_ms: default_busy_timeout_ms(),
            candle_duration_secs: default_candle_duration_secs(),
        }
    }
}

impl StoreConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read store config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse store config from {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("invalid store config in {}", path.display()))?;

        info!(
            path = %path.display(),
            db = %config.db_path,
            table = %config.table,
            max_size = config.max_size,
            min_size = config.min_size,
            "store config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise store config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "store config saved (atomic)");
        Ok(())
    }

    pub fn validate(&self) -> StoreResult<()> {
        self.limits().validate()?;
        if !valid_table_name(&self.table) {
            return Err(StoreError::InvalidTable(self.table.clone()));
        }
        let d = self.candle_duration_secs;
        if d == 0 || d > 60 || 60 % d != 0 {
            return Err(StoreError::InvalidConfig(format!(
                "candle_duration_secs {d} does not divide 60"
            )));
        }
        Ok(())
    }

    pub fn limits(&self) -> TierLimits {
        TierLimits {
            min_size: self.min_size,
            max_size: self.max_size,
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Aggregator producing candles `candle_duration_secs` wide.
    pub fn aggregator<F>(&self, on_close: F) -> StoreResult<CandleAggregator<F>>
    where
        F: FnMut(&Bucket, (f64, DateTime<Utc>)),
    {
        CandleAggregator::new(self.candle_duration_secs, on_close)
    }
}
