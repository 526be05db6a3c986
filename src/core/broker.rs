use crate::core::error::StormError;
use crate::core::pool;
use crate::core::store::Store;
use crate::core::time;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

/// The DB Broker is the "thin waist" for state access: every write passes
/// through the pool's per-DB write lock and leaves one line in the audit log.
pub struct DbBroker {
    db_path: PathBuf,
    audit_log_path: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BrokerEvent {
    pub ts: String,
    pub event_id: String,
    pub actor: String,
    pub op: String,
    pub db_id: String,
    pub status: String,
}

impl DbBroker {
    pub fn new(store: &Store) -> Self {
        Self {
            db_path: store.db_path(),
            audit_log_path: store.audit_log_path(),
        }
    }

    /// Execute a closure with the serialized write connection, then audit it.
    pub fn with_write<F, R>(&self, actor: &str, op_name: &str, f: F) -> Result<R, StormError>
    where
        F: FnOnce(&Connection) -> Result<R, StormError>,
    {
        let result = pool::global_pool().with_write(&self.db_path, f);
        self.log_event(actor, op_name, status_of(&result))?;
        result
    }

    /// Write path for closures that are safe to re-run on busy errors.
    pub fn with_write_retrying<F, R>(&self, actor: &str, op_name: &str, f: F) -> Result<R, StormError>
    where
        F: FnMut(&Connection) -> Result<R, StormError>,
    {
        let result = pool::global_pool().with_write_retrying(&self.db_path, f);
        self.log_event(actor, op_name, status_of(&result))?;
        result
    }

    /// Reads are not serialized and not audited.
    pub fn with_read<F, R>(&self, f: F) -> Result<R, StormError>
    where
        F: FnOnce(&Connection) -> Result<R, StormError>,
    {
        if !self.db_path.is_file() {
            return Err(StormError::NotFound(format!(
                "store database {} does not exist; run `stormledger init`",
                self.db_path.display()
            )));
        }
        pool::global_pool().with_read(&self.db_path, f)
    }

    fn log_event(&self, actor: &str, op: &str, status: &str) -> Result<(), StormError> {
        let db_id = self
            .db_path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();

        let ev = BrokerEvent {
            ts: time::now_epoch_z(),
            event_id: time::new_event_id(),
            actor: actor.to_string(),
            op: op.to_string(),
            db_id,
            status: status.to_string(),
        };

        let line = serde_json::to_string(&ev)?;

        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.audit_log_path)?;
        writeln!(f, "{}", line)?;
        Ok(())
    }
}

fn status_of<R>(result: &Result<R, StormError>) -> &'static str {
    if result.is_ok() { "success" } else { "error" }
}

/// Read back the audit log, oldest first.
pub fn read_audit_log(store: &Store) -> Result<Vec<BrokerEvent>, StormError> {
    let path = store.audit_log_path();
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(&path)?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| {
            serde_json::from_str(l).map_err(|e| {
                StormError::ValidationError(format!("corrupt audit log line: {}", e))
            })
        })
        .collect()
}
