//! Result Materializer: durable ledger tables, one per direction.
//!
//! A replacement is one IMMEDIATE transaction: delete every row, insert the
//! new set with ids reassigned 1..n in a deterministic order, stamp the change
//! log with the tick the inputs were read at, commit. Readers on other connections see either the old table or the
//! new one. If anything fails (or the caller bails out) before the commit, the
//! transaction is rolled back on drop and the previous rows remain.

use crate::core::broker::DbBroker;
use crate::core::error::StormError;
use crate::core::schemas;
use crate::core::store::Store;
use crate::subsystems::model::{Direction, LedgerEntry};
use crate::subsystems::staleness;
use rusqlite::{Connection, Row, Transaction, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const LEDGER_COLUMNS: &str = "node_id, subbasin, basinname, variable, \"order\", activity, direction, \
     epoch, value, units, percent_reduction, value_remaining_prev, value_remaining, load_reduced, step";

pub fn initialize_results_db(store: &Store) -> Result<(), StormError> {
    let broker = DbBroker::new(store);
    broker.with_write("stormledger", "results.init", |conn| {
        for direction in Direction::ALL {
            conn.execute_batch(&schemas::result_schema(direction.result_table()))?;
        }
        Ok(())
    })
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    Ok(LedgerEntry {
        node_id: row.get(0)?,
        subbasin: row.get(1)?,
        basinname: row.get(2)?,
        variable: row.get(3)?,
        order: row.get(4)?,
        activity: row.get(5)?,
        direction: row.get(6)?,
        epoch: row.get(7)?,
        value: row.get(8)?,
        units: row.get(9)?,
        percent_reduction: row.get(10)?,
        value_remaining_prev: row.get(11)?,
        value_remaining: row.get(12)?,
        load_reduced: row.get(13)?,
        step: row.get(14)?,
    })
}

/// Atomically swap the contents of `direction`'s ledger table for `rows`,
/// treating them as built from the inputs current at swap time.
/// Returns the number of rows written.
pub fn replace_results(
    conn: &Connection,
    direction: Direction,
    rows: &[LedgerEntry],
) -> Result<usize, StormError> {
    replace_results_as_of(conn, direction, rows, None)
}

/// Like [`replace_results`], for rows computed from inputs read at change
/// tick `as_of`. Inputs modified after that tick leave the table dirty.
pub fn replace_results_as_of(
    conn: &Connection,
    direction: Direction,
    rows: &[LedgerEntry],
    as_of: Option<i64>,
) -> Result<usize, StormError> {
    let table = direction.result_table();
    if let Some(stray) = rows.iter().find(|r| r.direction != direction) {
        return Err(StormError::ValidationError(format!(
            "{} ledger row for node {} cannot be stored in {}",
            stray.direction, stray.node_id, table
        )));
    }

    let mut ordered: Vec<&LedgerEntry> = rows.iter().collect();
    ordered.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

    write_swap(conn, table, &ordered, as_of).map_err(|source| StormError::ReplaceFailure {
        table: table.to_string(),
        source: Box::new(source),
    })?;

    tracing::info!(table, rows = ordered.len(), "ledger table replaced");
    Ok(ordered.len())
}

fn write_swap(
    conn: &Connection,
    table: &str,
    rows: &[&LedgerEntry],
    as_of: Option<i64>,
) -> Result<(), StormError> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    tx.execute(&format!("DELETE FROM {}", table), [])?;
    {
        let mut stmt = tx.prepare(&format!(
            "INSERT INTO {}(id, {}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            table, LEDGER_COLUMNS
        ))?;
        for (idx, r) in rows.iter().enumerate() {
            stmt.execute(params![
                idx as i64 + 1,
                r.node_id,
                r.subbasin,
                r.basinname,
                r.variable,
                r.order,
                r.activity,
                r.direction,
                r.epoch,
                r.value,
                r.units,
                r.percent_reduction,
                r.value_remaining_prev,
                r.value_remaining,
                r.load_reduced,
                r.step,
            ])?;
        }
    }
    staleness::mark_refreshed(&tx, table, as_of)?;
    tx.commit()?;
    Ok(())
}

/// Replace through the broker, retrying the whole swap on busy errors.
pub fn materialize(
    store: &Store,
    direction: Direction,
    rows: &[LedgerEntry],
    actor: &str,
) -> Result<usize, StormError> {
    materialize_as_of(store, direction, rows, None, actor)
}

/// [`materialize`] for rows computed from a snapshot taken at tick `as_of`.
pub fn materialize_as_of(
    store: &Store,
    direction: Direction,
    rows: &[LedgerEntry],
    as_of: Option<i64>,
    actor: &str,
) -> Result<usize, StormError> {
    let broker = DbBroker::new(store);
    let op = format!("results.replace_{}", direction);
    broker.with_write_retrying(actor, &op, |conn| {
        replace_results_as_of(conn, direction, rows, as_of)
    })
}

/// Stored ledger rows in id order, optionally filtered by node and epoch.
pub fn load_results(
    conn: &Connection,
    direction: Direction,
    node_id: Option<&str>,
    epoch: Option<&str>,
) -> Result<Vec<LedgerEntry>, StormError> {
    let sql = format!(
        "SELECT {} FROM {} WHERE (?1 IS NULL OR node_id = ?1) AND (?2 IS NULL OR epoch = ?2) ORDER BY id",
        LEDGER_COLUMNS,
        direction.result_table()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![node_id, epoch], entry_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// SHA-256 over the stored table, ids included. Identical inputs replaced
/// twice must produce identical digests.
pub fn ledger_digest(conn: &Connection, direction: Direction) -> Result<String, StormError> {
    let sql = format!(
        "SELECT id, {} FROM {} ORDER BY id",
        LEDGER_COLUMNS,
        direction.result_table()
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    let mut hasher = Sha256::new();
    while let Some(row) = rows.next()? {
        let id: i64 = row.get(0)?;
        hasher.update(id.to_le_bytes());
        for col in 1..=15 {
            let cell = match row.get_ref(col)? {
                rusqlite::types::ValueRef::Null => "\u{0}null".to_string(),
                rusqlite::types::ValueRef::Integer(i) => format!("i{}", i),
                rusqlite::types::ValueRef::Real(f) => format!("r{:016x}", f.to_bits()),
                rusqlite::types::ValueRef::Text(t) => format!("t{}", String::from_utf8_lossy(t)),
                rusqlite::types::ValueRef::Blob(b) => format!("b{}", b.len()),
            };
            hasher.update(cell.as_bytes());
            hasher.update([0x1f]);
        }
        hasher.update([0x1e]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Read-boundary view of one node: every materialized row plus a staleness flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeLedger {
    pub node_id: String,
    pub epoch: Option<String>,
    pub rows: Vec<LedgerEntry>,
    /// True when either ledger table may be out of date with its inputs.
    pub stale: bool,
}

pub fn node_ledger(
    conn: &Connection,
    node_id: &str,
    epoch: Option<&str>,
) -> Result<NodeLedger, StormError> {
    // One read transaction so both tables come from the same snapshot.
    let tx = conn.unchecked_transaction()?;
    let mut rows = Vec::new();
    let mut stale = false;
    for direction in Direction::ALL {
        rows.extend(load_results(&tx, direction, Some(node_id), epoch)?);
        stale |= staleness::is_dirty(&tx, direction.result_table(), None)?;
    }
    drop(tx);

    if rows.is_empty() {
        let epoch_detail = epoch.map(|e| format!(" and epoch={}", e)).unwrap_or_default();
        return Err(StormError::NotFound(format!(
            "node_id={}{}",
            node_id, epoch_detail
        )));
    }

    Ok(NodeLedger {
        node_id: node_id.to_string(),
        epoch: epoch.map(str::to_string),
        rows,
        stale,
    })
}

/// Fetch all ledger rows for a node, optionally filtered by epoch.
pub fn results_for_node(
    store: &Store,
    node_id: &str,
    epoch: Option<&str>,
) -> Result<NodeLedger, StormError> {
    if !store.is_initialized() {
        return Err(StormError::NotFound(format!(
            "node_id={} (store at {} is not initialized)",
            node_id,
            store.root.display()
        )));
    }
    DbBroker::new(store).with_read(|conn| node_ledger(conn, node_id, epoch))
}
