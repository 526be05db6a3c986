//! Baseline Load Provider: starting loads for each scope.
//!
//! Baseline rows are keyed by (node_id, epoch, variable) and live in one table
//! per direction. A node's subbasin comes from `network_node`; rows for nodes
//! without network membership cannot be scoped and are skipped. Multiple rows
//! for the same key are summed.

use crate::core::broker::DbBroker;
use crate::core::error::StormError;
use crate::core::schemas;
use crate::core::store::Store;
use crate::subsystems::catalog::normalize_variable;
use crate::subsystems::model::{BaselineLoad, BaselineRow, Direction, NetworkNode, Scope};
use rusqlite::{Connection, Transaction, TransactionBehavior, params};
use std::collections::BTreeMap;

pub fn initialize_baseline_db(store: &Store) -> Result<(), StormError> {
    let broker = DbBroker::new(store);
    broker.with_write("stormledger", "baseline.init", |conn| {
        conn.execute_batch(schemas::NETWORK_NODE_SCHEMA)?;
        conn.execute_batch(&schemas::change_trigger_ddl(schemas::NETWORK_NODE_TABLE))?;
        for direction in Direction::ALL {
            let table = direction.baseline_table();
            conn.execute_batch(&schemas::baseline_schema(table))?;
            conn.execute_batch(&schemas::change_trigger_ddl(table))?;
        }
        Ok(())
    })
}

/// Read-side contract the cascade engine depends on.
pub trait BaselineProvider {
    /// Fails with [`StormError::MissingBaseline`] when the scope has no load.
    fn baseline_for(&self, scope: &Scope) -> Result<BaselineLoad, StormError>;
}

impl<T: BaselineProvider + ?Sized> BaselineProvider for &T {
    fn baseline_for(&self, scope: &Scope) -> Result<BaselineLoad, StormError> {
        (**self).baseline_for(scope)
    }
}

struct Aggregate {
    basinname: Option<String>,
    total: f64,
    min_units: String,
    max_units: String,
}

fn finish_aggregate(scope: &Scope, agg: Aggregate) -> Result<BaselineLoad, String> {
    if agg.min_units != agg.max_units {
        return Err(format!(
            "mixed units '{}' and '{}' within one baseline",
            agg.min_units, agg.max_units
        ));
    }
    if !agg.total.is_finite() || agg.total < 0.0 {
        return Err(format!("baseline value {} must be finite and non-negative", agg.total));
    }
    Ok(BaselineLoad {
        node_id: scope.node_id.clone(),
        subbasin: scope.subbasin.clone(),
        basinname: agg.basinname,
        epoch: scope.epoch.clone(),
        variable: scope.variable.clone(),
        value: agg.total,
        units: agg.min_units,
    })
}

fn invalid_baseline(scope: &Scope, reason: String) -> StormError {
    StormError::InvalidBaseline {
        scope: scope.to_string(),
        reason,
    }
}

/// Provider backed by one aggregate query per scope.
pub struct SqliteBaselineProvider<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteBaselineProvider<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }
}

impl BaselineProvider for SqliteBaselineProvider<'_> {
    fn baseline_for(&self, scope: &Scope) -> Result<BaselineLoad, StormError> {
        let sql = format!(
            "SELECT COUNT(b.id), MAX(n.basinname), SUM(b.value), MIN(b.units), MAX(b.units)
             FROM {} b JOIN network_node n ON n.node_id = b.node_id
             WHERE b.node_id = ?1 AND n.subbasin = ?2 AND b.epoch = ?3 AND b.variable = ?4",
            scope.direction.baseline_table()
        );
        let (count, agg) = self.conn.query_row(
            &sql,
            params![scope.node_id, scope.subbasin, scope.epoch, scope.variable],
            |row| {
                let count: i64 = row.get(0)?;
                if count == 0 {
                    return Ok((0, None));
                }
                Ok((
                    count,
                    Some(Aggregate {
                        basinname: row.get(1)?,
                        total: row.get(2)?,
                        min_units: row.get(3)?,
                        max_units: row.get(4)?,
                    }),
                ))
            },
        )?;
        match agg {
            Some(agg) if count > 0 => {
                finish_aggregate(scope, agg).map_err(|reason| invalid_baseline(scope, reason))
            }
            _ => Err(StormError::MissingBaseline {
                scope: scope.to_string(),
            }),
        }
    }
}

/// Every baseline of one direction, aggregated per scope in one pass.
/// Scopes iterate in sorted order.
#[derive(Debug, Clone)]
pub struct BaselineSnapshot {
    pub direction: Direction,
    entries: BTreeMap<Scope, Result<BaselineLoad, String>>,
    /// Nodes that have baseline rows but no network membership.
    pub orphan_nodes: Vec<String>,
}

impl BaselineSnapshot {
    pub fn load(conn: &Connection, direction: Direction) -> Result<Self, StormError> {
        let table = direction.baseline_table();
        let sql = format!(
            "SELECT b.node_id, n.subbasin, MAX(n.basinname), b.epoch, b.variable,
                    SUM(b.value), MIN(b.units), MAX(b.units)
             FROM {} b JOIN network_node n ON n.node_id = b.node_id
             GROUP BY b.node_id, n.subbasin, b.epoch, b.variable",
            table
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            let scope = Scope {
                node_id: row.get(0)?,
                subbasin: row.get(1)?,
                variable: row.get(4)?,
                direction,
                epoch: row.get(3)?,
            };
            let agg = Aggregate {
                basinname: row.get(2)?,
                total: row.get(5)?,
                min_units: row.get(6)?,
                max_units: row.get(7)?,
            };
            Ok((scope, agg))
        })?;

        let mut entries = BTreeMap::new();
        for row in rows {
            let (scope, agg) = row?;
            let load = finish_aggregate(&scope, agg);
            entries.insert(scope, load);
        }

        let orphan_sql = format!(
            "SELECT DISTINCT node_id FROM {} WHERE node_id NOT IN (SELECT node_id FROM network_node) ORDER BY node_id",
            table
        );
        let mut stmt = conn.prepare(&orphan_sql)?;
        let orphan_nodes = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;

        Ok(Self {
            direction,
            entries,
            orphan_nodes,
        })
    }

    pub fn from_loads(direction: Direction, loads: impl IntoIterator<Item = BaselineLoad>) -> Self {
        let entries = loads
            .into_iter()
            .map(|load| {
                let scope = Scope::new(
                    load.node_id.clone(),
                    load.subbasin.clone(),
                    load.variable.clone(),
                    direction,
                    load.epoch.clone(),
                );
                (scope, Ok(load))
            })
            .collect();
        Self {
            direction,
            entries,
            orphan_nodes: Vec::new(),
        }
    }

    /// Scopes with a baseline, in sorted order.
    pub fn scopes(&self) -> impl Iterator<Item = &Scope> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl BaselineProvider for BaselineSnapshot {
    fn baseline_for(&self, scope: &Scope) -> Result<BaselineLoad, StormError> {
        match self.entries.get(scope) {
            Some(Ok(load)) => Ok(load.clone()),
            Some(Err(reason)) => Err(invalid_baseline(scope, reason.clone())),
            None => Err(StormError::MissingBaseline {
                scope: scope.to_string(),
            }),
        }
    }
}

// --- Administrative write path ---

fn validate_row(row: &BaselineRow) -> Result<BaselineRow, StormError> {
    let node_id = row.node_id.trim();
    let epoch = row.epoch.trim();
    if node_id.is_empty() || epoch.is_empty() {
        return Err(StormError::ValidationError(
            "baseline rows need a node_id and an epoch".to_string(),
        ));
    }
    if !row.value.is_finite() {
        return Err(StormError::ValidationError(format!(
            "baseline value for node {} is not finite",
            node_id
        )));
    }
    Ok(BaselineRow {
        node_id: node_id.to_string(),
        epoch: epoch.to_string(),
        variable: normalize_variable(&row.variable)?,
        value: row.value,
        units: row.units.trim().to_string(),
    })
}

fn insert_row(conn: &Connection, table: &str, row: &BaselineRow) -> Result<(), StormError> {
    let row = validate_row(row)?;
    conn.execute(
        &format!(
            "INSERT INTO {}(node_id, epoch, variable, value, units) VALUES (?1, ?2, ?3, ?4, ?5)",
            table
        ),
        params![row.node_id, row.epoch, row.variable, row.value, row.units],
    )?;
    Ok(())
}

pub fn upsert_node(store: &Store, node: &NetworkNode, actor: &str) -> Result<(), StormError> {
    if node.node_id.trim().is_empty() || node.subbasin.trim().is_empty() {
        return Err(StormError::ValidationError(
            "network nodes need a node_id and a subbasin".to_string(),
        ));
    }
    let broker = DbBroker::new(store);
    broker.with_write(actor, "baseline.node_upsert", |conn| {
        conn.execute(
            "INSERT INTO network_node(node_id, subbasin, basinname) VALUES (?1, ?2, ?3)
             ON CONFLICT(node_id) DO UPDATE SET subbasin = excluded.subbasin, basinname = excluded.basinname",
            params![node.node_id.trim(), node.subbasin.trim(), node.basinname],
        )?;
        Ok(())
    })
}

pub fn insert_baseline(
    store: &Store,
    direction: Direction,
    row: &BaselineRow,
    actor: &str,
) -> Result<(), StormError> {
    let broker = DbBroker::new(store);
    broker.with_write(actor, "baseline.row_insert", |conn| {
        insert_row(conn, direction.baseline_table(), row)
    })
}

/// Replace a direction's baseline table wholesale inside one transaction.
pub fn replace_baselines(
    conn: &Connection,
    direction: Direction,
    rows: &[BaselineRow],
) -> Result<usize, StormError> {
    let table = direction.baseline_table();
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    tx.execute(&format!("DELETE FROM {}", table), [])?;
    for row in rows {
        insert_row(&tx, table, row)?;
    }
    tx.commit()?;
    Ok(rows.len())
}

pub fn refresh_baselines(
    store: &Store,
    direction: Direction,
    rows: &[BaselineRow],
    actor: &str,
) -> Result<usize, StormError> {
    let broker = DbBroker::new(store);
    broker.with_write_retrying(actor, "baseline.refresh", |conn| {
        replace_baselines(conn, direction, rows)
    })
}

pub fn list_baselines(conn: &Connection, direction: Direction) -> Result<Vec<BaselineRow>, StormError> {
    let sql = format!(
        "SELECT node_id, epoch, variable, value, units FROM {} ORDER BY node_id, epoch, variable, id",
        direction.baseline_table()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |row| {
            Ok(BaselineRow {
                node_id: row.get(0)?,
                epoch: row.get(1)?,
                variable: row.get(2)?,
                value: row.get(3)?,
                units: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn list_nodes(conn: &Connection) -> Result<Vec<NetworkNode>, StormError> {
    let mut stmt =
        conn.prepare("SELECT node_id, subbasin, basinname FROM network_node ORDER BY node_id")?;
    let nodes = stmt
        .query_map([], |row| {
            Ok(NetworkNode {
                node_id: row.get(0)?,
                subbasin: row.get(1)?,
                basinname: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(nodes)
}
