// =============================================================================
// candle-store — inspector entry point
// =============================================================================
//
// Opens the configured store, logs a summary of both tiers and, when a key is
// given as the first argument, prints the matching records as JSON lines.
//
//   candle-store                 # summary only
//   candle-store 2024-03         # every candle in March 2024
//
// Configuration comes from `store_config.json` (defaults if absent), with
// CANDLE_STORE_DB / CANDLE_STORE_TABLE overriding the file.
// =============================================================================

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use candle_store::{StoreConfig, TieredCandleStore};

fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = StoreConfig::load("store_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        StoreConfig::default()
    });

    if let Ok(db) = std::env::var("CANDLE_STORE_DB") {
        config.db_path = db;
    }
    if let Ok(table) = std::env::var("CANDLE_STORE_TABLE") {
        config.table = table.trim().to_string();
    }

    // ── 2. Open store ────────────────────────────────────────────────────
    let store = TieredCandleStore::open(&config)
        .with_context(|| format!("failed to open candle store at {}", config.db_path))?;

    info!(
        db = %config.db_path,
        table = %config.table,
        layout = %config.layout,
        len = store.len(),
        persisted = store.persisted_len(),
        min_date = ?store.min_date()?,
        max_date = ?store.max_date()?,
        complete = store.is_complete()?,
        "store summary"
    );

    // ── 3. Optional period query ─────────────────────────────────────────
    if let Some(key) = std::env::args().nth(1) {
        let rows = store
            .get(key.as_str())
            .with_context(|| format!("query {key:?} failed"))?;
        for row in &rows {
            println!("{}", serde_json::to_string(row)?);
        }
        info!(key = %key, rows = rows.len(), "query complete");
    }

    Ok(())
}
