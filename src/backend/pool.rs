// =============================================================================
// Connection Pool — one SQLite handle per thread
// =============================================================================
//
// A rusqlite `Connection` must not be used from two threads at once. The pool
// therefore owns a primary handle for the thread that opened it and lazily
// opens a private handle for every other thread that calls in, cached by
// `ThreadId`. A handle is only ever locked by the thread it belongs to; the
// mutexes exist to make the pool `Sync`, not to arbitrate between threads.
//
// A failed open is never cached, so a caller may simply retry to get a fresh
// connection.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};

static MEMORY_DB_SEQ: AtomicU64 = AtomicU64::new(0);

/// Per-thread SQLite handles over one database.
///
/// Worker handles live in the map until their thread calls
/// [`release_current_thread`](Self::release_current_thread). Nothing reaps
/// them when a thread exits, so a pool shared with many short-lived threads
/// grows by one open connection per thread unless each releases its handle.
pub struct ConnectionPool {
    /// Path or URI handed to every `Connection::open_with_flags`.
    target: String,
    journal_mode: String,
    busy_timeout: Duration,
    owner: ThreadId,
    primary: Mutex<Connection>,
    workers: Mutex<HashMap<ThreadId, Arc<Mutex<Connection>>>>,
}

impl ConnectionPool {
    /// Open the primary handle on the calling thread.
    ///
    /// `":memory:"` maps to a uniquely named shared-cache database so that the
    /// per-thread handles all see the same tables.
    pub fn open(db_path: &str, journal_mode: &str, busy_timeout: Duration) -> StoreResult<Self> {
        if journal_mode.is_empty() || !journal_mode.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(StoreError::InvalidConfig(format!(
                "unsupported journal mode {journal_mode:?}"
            )));
        }

        let target = if db_path == ":memory:" {
            let seq = MEMORY_DB_SEQ.fetch_add(1, Ordering::Relaxed);
            format!(
                "file:candle-store-{}-{seq}?mode=memory&cache=shared",
                std::process::id()
            )
        } else {
            if let Some(parent) = std::path::Path::new(db_path).parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        StoreError::InvalidConfig(format!(
                            "cannot create directory {}: {e}",
                            parent.display()
                        ))
                    })?;
                }
            }
            db_path.to_string()
        };

        let primary = connect(&target, journal_mode, busy_timeout)?;
        info!(target = %target, journal_mode = %journal_mode, "sqlite pool opened");

        Ok(Self {
            target,
            journal_mode: journal_mode.to_string(),
            busy_timeout,
            owner: thread::current().id(),
            primary: Mutex::new(primary),
            workers: Mutex::new(HashMap::new()),
        })
    }

    /// Run `f` with the calling thread's connection.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let tid = thread::current().id();
        if tid == self.owner {
            let mut conn = self.primary.lock();
            return f(&mut conn);
        }

        let handle = self.worker_handle(tid)?;
        let mut conn = handle.lock();
        f(&mut conn)
    }

    fn worker_handle(&self, tid: ThreadId) -> StoreResult<Arc<Mutex<Connection>>> {
        if let Some(handle) = self.workers.lock().get(&tid) {
            return Ok(Arc::clone(handle));
        }

        // Opened outside the map lock; only this thread can insert this key.
        let conn = connect(&self.target, &self.journal_mode, self.busy_timeout)?;
        let handle = Arc::new(Mutex::new(conn));
        self.workers.lock().insert(tid, Arc::clone(&handle));
        debug!(thread = ?tid, "opened worker connection");
        Ok(handle)
    }

    /// Drop the calling thread's private handle, if it has one. Worker threads
    /// should call this before exiting; the primary handle is never released.
    pub fn release_current_thread(&self) -> bool {
        let tid = thread::current().id();
        if tid == self.owner {
            return false;
        }
        self.workers.lock().remove(&tid).is_some()
    }

    /// Number of non-owner threads currently holding a cached handle.
    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn owner(&self) -> ThreadId {
        self.owner
    }
}

fn connect(target: &str, journal_mode: &str, busy_timeout: Duration) -> StoreResult<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;

    let conn = Connection::open_with_flags(target, flags)?;
    conn.busy_timeout(busy_timeout)?;
    // In-memory databases report "memory" regardless of the requested mode.
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", journal_mode, |row| row.get(0))?;
    debug!(target = %target, journal_mode = %mode, "sqlite connection ready");
    Ok(conn)
}
