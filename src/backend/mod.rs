// =============================================================================
// Persistent Backend — durable SQLite tier of the candle store
// =============================================================================

pub mod pool;
pub mod sqlite;

pub use pool::ConnectionPool;
pub use sqlite::{SqliteBackend, UpsertOutcome};

/// Table names are interpolated into SQL, so only plain identifiers pass.
pub fn valid_table_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
