use rusqlite;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StormError {
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Failed to initialize database: {0}")]
    DatabaseInitializationError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    /// No baseline load exists for a scope. Providers return this; the
    /// cascade engine absorbs it as "nothing to reduce".
    #[error("Missing baseline load for {scope}")]
    MissingBaseline { scope: String },
    #[error("Invalid rule data for {scope} (activity={activity}): {reason}")]
    InvalidRuleData {
        scope: String,
        activity: String,
        reason: String,
    },
    #[error("Invalid baseline load for {scope}: {reason}")]
    InvalidBaseline { scope: String, reason: String },
    #[error("Failed to replace {table}: {source}")]
    ReplaceFailure {
        table: String,
        #[source]
        source: Box<StormError>,
    },
    #[error("Pipeline run cancelled before results were swapped in")]
    Cancelled,
}

impl StormError {
    /// True for errors that invalidate a single scope's ledger.
    pub fn is_scope_fatal(&self) -> bool {
        matches!(
            self,
            StormError::InvalidRuleData { .. } | StormError::InvalidBaseline { .. }
        )
    }
}
