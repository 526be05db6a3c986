//! Shared domain types: directions, scopes, rules, baselines and ledger rows.

use crate::core::error::StormError;
use crate::core::schemas;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Whether a reduction applies to load flowing into a point (upstream) or
/// leaving it (downstream).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upstream,
    Downstream,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Upstream, Direction::Downstream];

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Upstream => "upstream",
            Direction::Downstream => "downstream",
        }
    }

    /// Ledger output table for this direction.
    pub fn result_table(self) -> &'static str {
        match self {
            Direction::Upstream => schemas::UPSTREAM_RESULT_TABLE,
            Direction::Downstream => schemas::DOWNSTREAM_RESULT_TABLE,
        }
    }

    /// Baseline input table feeding this direction's cascades.
    pub fn baseline_table(self) -> &'static str {
        match self {
            Direction::Upstream => schemas::UPSTREAM_BASELINE_TABLE,
            Direction::Downstream => schemas::DOWNSTREAM_BASELINE_TABLE,
        }
    }

    pub fn from_result_table(table: &str) -> Option<Direction> {
        Direction::ALL.into_iter().find(|d| d.result_table() == table)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = StormError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "upstream" => Ok(Direction::Upstream),
            "downstream" => Ok(Direction::Downstream),
            other => Err(StormError::ValidationError(format!(
                "invalid direction '{}': expected upstream or downstream",
                other
            ))),
        }
    }
}

impl ToSql for Direction {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Direction {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: StormError| FromSqlError::Other(e.to_string().into()))
    }
}

/// One (node, subbasin, variable, direction, epoch) combination. Each scope
/// gets its own independent cascade.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Scope {
    pub node_id: String,
    pub subbasin: String,
    pub variable: String,
    pub direction: Direction,
    pub epoch: String,
}

impl Scope {
    pub fn new(
        node_id: impl Into<String>,
        subbasin: impl Into<String>,
        variable: impl Into<String>,
        direction: Direction,
        epoch: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            subbasin: subbasin.into(),
            variable: variable.into(),
            direction,
            epoch: epoch.into(),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "direction={} node_id={} subbasin={} variable={} epoch={}",
            self.direction, self.node_id, self.subbasin, self.variable, self.epoch
        )
    }
}

/// A catalogued intervention. Keyed by (direction, subbasin, variable);
/// the audit columns (`node_id`, `basinname`, `epoch`, `value`, `units`) are
/// carried but never used for scoping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceControlRule {
    pub id: i64,
    pub direction: Direction,
    pub subbasin: String,
    pub variable: String,
    pub activity: String,
    pub order: Option<i64>,
    pub percent_reduction: f64,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub basinname: Option<String>,
    #[serde(default)]
    pub epoch: Option<String>,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub units: Option<String>,
    #[serde(default)]
    pub updated_by: Option<String>,
    #[serde(default)]
    pub updated_at: String,
}

impl SourceControlRule {
    pub fn new(
        id: i64,
        direction: Direction,
        subbasin: &str,
        variable: &str,
        activity: &str,
        order: Option<i64>,
        percent_reduction: f64,
    ) -> Self {
        Self {
            id,
            direction,
            subbasin: subbasin.to_string(),
            variable: variable.to_string(),
            activity: activity.to_string(),
            order,
            percent_reduction,
            node_id: None,
            basinname: None,
            epoch: None,
            value: None,
            units: None,
            updated_by: None,
            updated_at: String::new(),
        }
    }

    /// Sequencing key: null orders sort after every defined order,
    /// including `i64::MAX`.
    pub fn order_key(&self) -> (bool, i64) {
        (self.order.is_none(), self.order.unwrap_or(0))
    }
}

/// Starting load for a scope, aggregated from the direction's baseline table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineLoad {
    pub node_id: String,
    pub subbasin: String,
    pub basinname: Option<String>,
    pub epoch: String,
    pub variable: String,
    pub value: f64,
    pub units: String,
}

/// One raw baseline input row as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineRow {
    pub node_id: String,
    pub epoch: String,
    pub variable: String,
    pub value: f64,
    pub units: String,
}

/// A drainage-network location and its sub-area membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkNode {
    pub node_id: String,
    pub subbasin: String,
    pub basinname: Option<String>,
}

/// One applied-intervention step of a cascade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub node_id: String,
    pub subbasin: String,
    pub basinname: Option<String>,
    pub variable: String,
    pub direction: Direction,
    pub epoch: String,
    pub order: Option<i64>,
    pub activity: String,
    /// Baseline load of the scope, repeated on every row for audit.
    pub value: Option<f64>,
    pub units: Option<String>,
    pub percent_reduction: f64,
    pub value_remaining_prev: f64,
    pub value_remaining: f64,
    pub load_reduced: f64,
    /// 1-based position of this row in its scope's cascade.
    pub step: i64,
}

impl LedgerEntry {
    /// Deterministic storage ordering: scopes sorted, rows within a scope in
    /// application order.
    pub fn sort_key(&self) -> (&str, &str, &str, &str, i64) {
        (
            &self.node_id,
            &self.subbasin,
            &self.variable,
            &self.epoch,
            self.step,
        )
    }
}
