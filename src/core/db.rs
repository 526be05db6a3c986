use crate::core::error::StormError;
use rusqlite::Connection;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Open a connection with WAL journaling, foreign keys and the given busy timeout.
pub fn db_connect_pooled(db_path: &str, busy_timeout_secs: u32) -> Result<Connection, StormError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(Duration::from_secs(u64::from(busy_timeout_secs)))?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
    conn.execute("PRAGMA foreign_keys=ON;", [])?;
    Ok(conn)
}

/// Make sure the store root exists and is writable before any database is opened.
pub fn storage_health_preflight(root: &Path) -> Result<(), StormError> {
    fs::create_dir_all(root).map_err(|e| {
        StormError::DatabaseInitializationError(format!(
            "STORAGE_PREFLIGHT_FAILED: cannot create {}: {}",
            root.display(),
            e
        ))
    })?;
    let probe = root.join(".write_probe");
    fs::write(&probe, b"ok").map_err(|e| {
        StormError::DatabaseInitializationError(format!(
            "STORAGE_PREFLIGHT_FAILED: {} is not writable: {}",
            root.display(),
            e
        ))
    })?;
    let _ = fs::remove_file(&probe);
    Ok(())
}
