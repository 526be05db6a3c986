//! Store abstraction for the ledger's on-disk state.
//!
//! A store is one directory holding the SQLite database and the broker's
//! mutation audit log. Every pipeline run and read query is scoped to a store.

use crate::core::schemas;
use std::path::{Path, PathBuf};

/// Store handle representing a stormledger workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Store {
    /// Absolute or working-directory-relative path to the store root
    pub root: PathBuf,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn db_path(&self) -> PathBuf {
        ledger_db_path(&self.root)
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.root.join(schemas::AUDIT_LOG_NAME)
    }

    /// True once `stormledger init` (or any write) has created the database.
    pub fn is_initialized(&self) -> bool {
        self.db_path().is_file()
    }
}

pub fn ledger_db_path(root: &Path) -> PathBuf {
    root.join(schemas::LEDGER_DB_NAME)
}
