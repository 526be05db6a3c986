//! SQLite connection pool with read/write separation and retry logic.
//!
//! - Maintains a **write mutex** per DB so writers inside one process never
//!   interleave (one writer at a time per result table follows from this).
//! - Creates fresh **read connections** per operation (no mutex, concurrent via WAL);
//!   readers always see the last committed snapshot.
//! - Retries `SQLITE_BUSY` / `SQLITE_LOCKED` with exponential backoff for
//!   cross-process contention.
//!
//! Connections are opened fresh each time rather than cached, so no mutable
//! connection state is ever shared between pipeline runs.

use crate::core::db;
use crate::core::error::StormError;
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

/// Maximum retry attempts for busy/locked errors.
const MAX_RETRIES: u32 = 5;
/// Base delay for exponential backoff (milliseconds).
const BASE_DELAY_MS: u64 = 100;
/// Maximum delay cap (milliseconds).
const MAX_DELAY_MS: u64 = 5_000;

/// Write connection busy_timeout in seconds.
const WRITE_BUSY_TIMEOUT_SECS: u32 = 5;
/// Read connection busy_timeout in seconds.
const READ_BUSY_TIMEOUT_SECS: u32 = 5;

/// Per-database entry holding a write mutex for serialized write access.
struct PoolEntry {
    write_lock: Mutex<()>,
    db_path: PathBuf,
}

/// Connection pool providing read/write separation per SQLite database.
pub struct SqlitePool {
    entries: Mutex<HashMap<PathBuf, Arc<PoolEntry>>>,
}

impl SqlitePool {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn get_entry(&self, db_path: &Path) -> Result<Arc<PoolEntry>, StormError> {
        let key = db_path.to_path_buf();
        let mut entries = self.entries.lock().map_err(|_| {
            StormError::ValidationError("SqlitePool entries lock poisoned".to_string())
        })?;
        let entry = entries.entry(key.clone()).or_insert_with(|| {
            Arc::new(PoolEntry {
                write_lock: Mutex::new(()),
                db_path: key,
            })
        });
        Ok(Arc::clone(entry))
    }

    /// Execute a closure with a write connection for the given DB path.
    /// Write access is serialized per-DB via mutex.
    pub fn with_write<F, R>(&self, db_path: &Path, f: F) -> Result<R, StormError>
    where
        F: FnOnce(&Connection) -> Result<R, StormError>,
    {
        let entry = self.get_entry(db_path)?;
        let _guard = entry
            .write_lock
            .lock()
            .map_err(|_| StormError::ValidationError("Pool write lock poisoned".to_string()))?;

        let conn =
            db::db_connect_pooled(&entry.db_path.to_string_lossy(), WRITE_BUSY_TIMEOUT_SECS)?;

        f(&conn)
    }

    /// Like [`SqlitePool::with_write`], but re-runs the whole closure on busy/locked
    /// errors. The closure must be safe to repeat, which holds for anything that
    /// does all its work inside one transaction.
    pub fn with_write_retrying<F, R>(&self, db_path: &Path, mut f: F) -> Result<R, StormError>
    where
        F: FnMut(&Connection) -> Result<R, StormError>,
    {
        retry_on_busy(|| self.with_write(db_path, |conn| f(conn)))
    }

    /// Execute a closure with a read connection (no mutex serialization).
    /// WAL mode allows concurrent readers across threads and processes.
    pub fn with_read<F, R>(&self, db_path: &Path, f: F) -> Result<R, StormError>
    where
        F: FnOnce(&Connection) -> Result<R, StormError>,
    {
        let conn = db::db_connect_pooled(&db_path.to_string_lossy(), READ_BUSY_TIMEOUT_SECS)?;

        f(&conn)
    }
}

/// Process-wide pool. Holds only per-path write locks, never connections.
pub fn global_pool() -> &'static SqlitePool {
    static POOL: OnceLock<SqlitePool> = OnceLock::new();
    POOL.get_or_init(SqlitePool::new)
}

/// Retry a closure on `SQLITE_BUSY` / `DatabaseBusy` with exponential backoff.
fn retry_on_busy<F, R>(mut f: F) -> Result<R, StormError>
where
    F: FnMut() -> Result<R, StormError>,
{
    let mut attempt = 0u32;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) if is_busy_error(&e) && attempt < MAX_RETRIES => {
                attempt += 1;
                let delay_ms = (BASE_DELAY_MS * 2u64.pow(attempt - 1)).min(MAX_DELAY_MS);
                tracing::warn!(attempt, delay_ms, "database busy, retrying write");
                thread::sleep(Duration::from_millis(delay_ms));
            }
            Err(e) => return Err(e),
        }
    }
}

/// Check if an error is a SQLite busy/locked error that is retryable.
pub(crate) fn is_busy_error(err: &StormError) -> bool {
    match err {
        StormError::RusqliteError(rusqlite::Error::SqliteFailure(code, _)) => matches!(
            code.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ),
        StormError::ReplaceFailure { source, .. } => is_busy_error(source),
        _ => false,
    }
}
