//! Staleness Tracker: is a derived table older than the inputs it was built from?
//!
//! Every tracked input table advances a shared logical clock on each mutation
//! (via triggers) and records the tick in `table_change_log`. Materializing a
//! ledger table stamps it, inside the swap transaction, with the tick its
//! inputs were read at. A derived table is dirty when any dependent carries a
//! newer tick, or when it has never been stamped at all.

use crate::core::broker::DbBroker;
use crate::core::error::StormError;
use crate::core::schemas;
use crate::core::store::Store;
use crate::subsystems::model::Direction;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

const UPSTREAM_DEPENDENTS: &[&str] = &[
    schemas::RULE_TABLE,
    schemas::NETWORK_NODE_TABLE,
    schemas::UPSTREAM_BASELINE_TABLE,
];

const DOWNSTREAM_DEPENDENTS: &[&str] = &[
    schemas::RULE_TABLE,
    schemas::NETWORK_NODE_TABLE,
    schemas::DOWNSTREAM_BASELINE_TABLE,
];

pub fn initialize_staleness_db(store: &Store) -> Result<(), StormError> {
    let broker = DbBroker::new(store);
    broker.with_write("stormledger", "staleness.init", |conn| {
        conn.execute_batch(schemas::CHANGE_LOG_SCHEMA)?;
        Ok(())
    })
}

/// Inputs a derived table is computed from. Unknown tables have none.
pub fn default_dependents(table: &str) -> &'static [&'static str] {
    match Direction::from_result_table(table) {
        Some(Direction::Upstream) => UPSTREAM_DEPENDENTS,
        Some(Direction::Downstream) => DOWNSTREAM_DEPENDENTS,
        None => &[],
    }
}

/// Current value of the shared change clock. Zero before any tracked write.
pub fn current_tick(conn: &Connection) -> Result<i64, StormError> {
    if !change_log_exists(conn)? {
        return Ok(0);
    }
    let tick = conn
        .query_row("SELECT tick FROM change_clock WHERE id = 1", [], |row| row.get(0))
        .optional()?;
    Ok(tick.unwrap_or(0))
}

/// Stamp derived `table` as built from inputs as of tick `as_of` (the current
/// tick when `None`). Call inside the writing transaction. Does not advance
/// the clock: any input written after `as_of` leaves the table dirty.
pub fn mark_refreshed(
    conn: &Connection,
    table: &str,
    as_of: Option<i64>,
) -> Result<(), StormError> {
    let version = match as_of {
        Some(tick) => tick,
        None => current_tick(conn)?,
    };
    conn.execute(
        "INSERT OR REPLACE INTO table_change_log(tablename, version, last_updated)
         VALUES (?1, ?2, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))",
        params![table, version],
    )?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableVersion {
    pub version: i64,
    pub last_updated: String,
}

fn change_log_exists(conn: &Connection) -> Result<bool, StormError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![schemas::CHANGE_LOG_TABLE],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn table_version(conn: &Connection, table: &str) -> Result<Option<TableVersion>, StormError> {
    if !change_log_exists(conn)? {
        return Ok(None);
    }
    let v = conn
        .query_row(
            "SELECT version, last_updated FROM table_change_log WHERE tablename = ?1",
            params![table],
            |row| {
                Ok(TableVersion {
                    version: row.get(0)?,
                    last_updated: row.get(1)?,
                })
            },
        )
        .optional()?;
    Ok(v)
}

/// Staleness answer in the shape read endpoints expose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirtyReport {
    pub tablename: String,
    pub is_dirty: bool,
    pub last_updated: Option<String>,
    /// Dependents modified after the table was last materialized.
    pub newer_dependents: Vec<String>,
}

pub fn staleness(
    conn: &Connection,
    table: &str,
    dependents: Option<&[&str]>,
) -> Result<DirtyReport, StormError> {
    let dependents = dependents.unwrap_or_else(|| default_dependents(table));
    let Some(own) = table_version(conn, table)? else {
        return Ok(DirtyReport {
            tablename: table.to_string(),
            is_dirty: true,
            last_updated: None,
            newer_dependents: Vec::new(),
        });
    };

    let mut newer = Vec::new();
    for dep in dependents {
        if let Some(dep_version) = table_version(conn, dep)? {
            if dep_version.version > own.version {
                newer.push((*dep).to_string());
            }
        }
    }

    Ok(DirtyReport {
        tablename: table.to_string(),
        is_dirty: !newer.is_empty(),
        last_updated: Some(own.last_updated),
        newer_dependents: newer,
    })
}

/// True when `table` must be recomputed before its contents can be trusted.
pub fn is_dirty(
    conn: &Connection,
    table: &str,
    dependents: Option<&[&str]>,
) -> Result<bool, StormError> {
    Ok(staleness(conn, table, dependents)?.is_dirty)
}

/// Store-level read query; never writes. A store that was never initialized
/// has never materialized anything, so every table is dirty.
pub fn check_staleness(
    store: &Store,
    table: &str,
    dependents: Option<&[String]>,
) -> Result<DirtyReport, StormError> {
    if !store.is_initialized() {
        return Ok(DirtyReport {
            tablename: table.to_string(),
            is_dirty: true,
            last_updated: None,
            newer_dependents: Vec::new(),
        });
    }
    let deps: Option<Vec<&str>> = dependents.map(|d| d.iter().map(String::as_str).collect());
    DbBroker::new(store).with_read(|conn| staleness(conn, table, deps.as_deref()))
}
