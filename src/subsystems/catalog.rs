//! Rule Catalog: the ordered set of source-control interventions.
//!
//! Rules are keyed by (direction, subbasin, variable) and sequenced by a
//! nullable `order`. The catalog derives an explicit total order at read time
//! (null orders last, ties by rule id) and rejects rules whose numeric or
//! uniqueness contract is broken. Administrators edit the catalog through
//! [`create_rule`], [`patch_rule`] and [`delete_rule`]; the cascade engine only
//! ever reads it.

use crate::core::broker::DbBroker;
use crate::core::error::StormError;
use crate::core::schemas;
use crate::core::store::Store;
use crate::core::time;
use crate::subsystems::model::{Direction, SourceControlRule};
use regex::Regex;
use rusqlite::{Connection, OptionalExtension, Row, params};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

const RULE_COLUMNS: &str = "id, direction, subbasin, variable, activity, \"order\", percent_reduction, \
     node_id, basinname, epoch, value, units, updated_by, updated_at";

pub fn initialize_catalog_db(store: &Store) -> Result<(), StormError> {
    let broker = DbBroker::new(store);
    broker.with_write("stormledger", "catalog.init", |conn| {
        conn.execute_batch(schemas::RULE_SCHEMA)?;
        conn.execute_batch(&schemas::change_trigger_ddl(schemas::RULE_TABLE))?;
        Ok(())
    })
}

/// Read-side contract the cascade engine depends on.
pub trait RuleCatalog {
    /// Rules for one scope in application order. Empty when none apply.
    fn rules_for(
        &self,
        direction: Direction,
        subbasin: &str,
        variable: &str,
    ) -> Result<Vec<SourceControlRule>, StormError>;
}

impl<T: RuleCatalog + ?Sized> RuleCatalog for &T {
    fn rules_for(
        &self,
        direction: Direction,
        subbasin: &str,
        variable: &str,
    ) -> Result<Vec<SourceControlRule>, StormError> {
        (**self).rules_for(direction, subbasin, variable)
    }
}

/// Sort ascending by order, null orders last, ties broken by rule id.
pub fn order_rules(rules: &mut [SourceControlRule]) {
    rules.sort_by_key(|r| (r.order_key(), r.id));
}

fn catalog_scope(direction: Direction, subbasin: &str, variable: &str) -> String {
    format!(
        "direction={} subbasin={} variable={}",
        direction, subbasin, variable
    )
}

/// Reason a percent reduction is unusable, if any.
pub fn percent_reduction_problem(pct: f64) -> Option<String> {
    if !pct.is_finite() {
        Some(format!("percent_reduction {} is not a finite number", pct))
    } else if !(0.0..=100.0).contains(&pct) {
        Some(format!("percent_reduction {} is outside [0, 100]", pct))
    } else {
        None
    }
}

/// Enforce the numeric and uniqueness contract over one scope's rules.
pub fn validate_scope_rules(
    direction: Direction,
    subbasin: &str,
    variable: &str,
    rules: &[SourceControlRule],
) -> Result<(), StormError> {
    let mut activities = FxHashSet::default();
    let mut orders = FxHashSet::default();
    for rule in rules {
        let invalid = |reason: String| StormError::InvalidRuleData {
            scope: catalog_scope(direction, subbasin, variable),
            activity: rule.activity.clone(),
            reason,
        };
        if let Some(reason) = percent_reduction_problem(rule.percent_reduction) {
            return Err(invalid(reason));
        }
        if !activities.insert(rule.activity.as_str()) {
            return Err(invalid("duplicate activity within scope".to_string()));
        }
        if let Some(order) = rule.order {
            if !orders.insert(order) {
                return Err(invalid(format!("order {} is used twice within scope", order)));
            }
        }
    }
    Ok(())
}

fn finish_scope(
    direction: Direction,
    subbasin: &str,
    variable: &str,
    mut rules: Vec<SourceControlRule>,
) -> Result<Vec<SourceControlRule>, StormError> {
    validate_scope_rules(direction, subbasin, variable, &rules)?;
    order_rules(&mut rules);
    Ok(rules)
}

fn rule_from_row(row: &Row<'_>) -> rusqlite::Result<SourceControlRule> {
    Ok(SourceControlRule {
        id: row.get(0)?,
        direction: row.get(1)?,
        subbasin: row.get(2)?,
        variable: row.get(3)?,
        activity: row.get(4)?,
        order: row.get(5)?,
        percent_reduction: row.get(6)?,
        node_id: row.get(7)?,
        basinname: row.get(8)?,
        epoch: row.get(9)?,
        value: row.get(10)?,
        units: row.get(11)?,
        updated_by: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

/// Catalog backed by one query per scope on a borrowed connection.
pub struct SqliteRuleCatalog<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteRuleCatalog<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }
}

impl RuleCatalog for SqliteRuleCatalog<'_> {
    fn rules_for(
        &self,
        direction: Direction,
        subbasin: &str,
        variable: &str,
    ) -> Result<Vec<SourceControlRule>, StormError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE direction = ?1 AND subbasin = ?2 AND variable = ?3",
            RULE_COLUMNS,
            schemas::RULE_TABLE
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rules = stmt
            .query_map(params![direction, subbasin, variable], rule_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        finish_scope(direction, subbasin, variable, rules)
    }
}

/// Whole catalog loaded once and indexed by scope. Immutable after load, so
/// it can be shared across worker threads.
#[derive(Debug, Clone, Default)]
pub struct RuleSnapshot {
    by_scope: FxHashMap<(Direction, String, String), Vec<SourceControlRule>>,
}

impl RuleSnapshot {
    pub fn from_rules(rules: impl IntoIterator<Item = SourceControlRule>) -> Self {
        let mut by_scope: FxHashMap<(Direction, String, String), Vec<SourceControlRule>> =
            FxHashMap::default();
        for rule in rules {
            by_scope
                .entry((rule.direction, rule.subbasin.clone(), rule.variable.clone()))
                .or_default()
                .push(rule);
        }
        Self { by_scope }
    }

    pub fn load(conn: &Connection, direction: Option<Direction>) -> Result<Self, StormError> {
        Ok(Self::from_rules(list_rules(conn, direction)?))
    }

    pub fn rule_count(&self) -> usize {
        self.by_scope.values().map(Vec::len).sum()
    }
}

impl RuleCatalog for RuleSnapshot {
    fn rules_for(
        &self,
        direction: Direction,
        subbasin: &str,
        variable: &str,
    ) -> Result<Vec<SourceControlRule>, StormError> {
        let key = (direction, subbasin.to_string(), variable.to_string());
        let rules = self.by_scope.get(&key).cloned().unwrap_or_default();
        finish_scope(direction, subbasin, variable, rules)
    }
}

// --- Administrative write path ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRule {
    pub direction: Direction,
    pub subbasin: String,
    pub variable: String,
    pub activity: String,
    pub order: Option<i64>,
    pub percent_reduction: f64,
}

/// Partial update; `None` leaves a field untouched. `order: Some(None)`
/// clears the order so the rule is applied last.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RulePatch {
    pub direction: Option<Direction>,
    pub subbasin: Option<String>,
    pub variable: Option<String>,
    pub activity: Option<String>,
    pub order: Option<Option<i64>>,
    pub percent_reduction: Option<f64>,
}

fn variable_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Z][A-Z0-9_]*$").expect("static pattern"))
}

/// Pollutant codes are stored as upper-case abbreviations.
pub fn normalize_variable(raw: &str) -> Result<String, StormError> {
    let code = raw.trim().to_uppercase();
    if variable_pattern().is_match(&code) {
        Ok(code)
    } else {
        Err(StormError::ValidationError(format!(
            "invalid pollutant variable '{}': expected an upper-case abbreviation like TSS or TN",
            raw
        )))
    }
}

fn validate_new_rule(rule: &NewRule) -> Result<NewRule, StormError> {
    let variable = normalize_variable(&rule.variable)?;
    let subbasin = rule.subbasin.trim().to_string();
    let activity = rule.activity.trim().to_string();
    let invalid = |reason: String| StormError::InvalidRuleData {
        scope: catalog_scope(rule.direction, &subbasin, &variable),
        activity: activity.clone(),
        reason,
    };
    if subbasin.is_empty() {
        return Err(invalid("subbasin must not be empty".to_string()));
    }
    if activity.is_empty() {
        return Err(invalid("activity must not be empty".to_string()));
    }
    if let Some(reason) = percent_reduction_problem(rule.percent_reduction) {
        return Err(invalid(reason));
    }
    Ok(NewRule {
        direction: rule.direction,
        subbasin,
        variable,
        activity,
        order: rule.order,
        percent_reduction: rule.percent_reduction,
    })
}

fn map_unique_violation(err: rusqlite::Error, rule: &NewRule) -> StormError {
    if let rusqlite::Error::SqliteFailure(code, msg) = &err {
        if code.code == rusqlite::ErrorCode::ConstraintViolation {
            return StormError::InvalidRuleData {
                scope: catalog_scope(rule.direction, &rule.subbasin, &rule.variable),
                activity: rule.activity.clone(),
                reason: format!(
                    "uniqueness violated: {}",
                    msg.as_deref().unwrap_or("constraint failed")
                ),
            };
        }
    }
    StormError::RusqliteError(err)
}

pub fn insert_rule(conn: &Connection, rule: &NewRule, updated_by: &str) -> Result<i64, StormError> {
    let rule = validate_new_rule(rule)?;
    conn.execute(
        "INSERT INTO tmnt_source_control(direction, subbasin, variable, activity, \"order\", percent_reduction, updated_by, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            rule.direction,
            rule.subbasin,
            rule.variable,
            rule.activity,
            rule.order,
            rule.percent_reduction,
            updated_by,
            time::now_epoch_z()
        ],
    )
    .map_err(|e| map_unique_violation(e, &rule))?;
    Ok(conn.last_insert_rowid())
}

pub fn get_rule(conn: &Connection, id: i64) -> Result<Option<SourceControlRule>, StormError> {
    let sql = format!("SELECT {} FROM {} WHERE id = ?1", RULE_COLUMNS, schemas::RULE_TABLE);
    Ok(conn.query_row(&sql, params![id], rule_from_row).optional()?)
}

pub fn update_rule(
    conn: &Connection,
    id: i64,
    patch: &RulePatch,
    updated_by: &str,
) -> Result<SourceControlRule, StormError> {
    let current = get_rule(conn, id)?
        .ok_or_else(|| StormError::NotFound(format!("source control rule id={}", id)))?;
    let merged = validate_new_rule(&NewRule {
        direction: patch.direction.unwrap_or(current.direction),
        subbasin: patch.subbasin.clone().unwrap_or(current.subbasin),
        variable: patch.variable.clone().unwrap_or(current.variable),
        activity: patch.activity.clone().unwrap_or(current.activity),
        order: patch.order.unwrap_or(current.order),
        percent_reduction: patch.percent_reduction.unwrap_or(current.percent_reduction),
    })?;
    conn.execute(
        "UPDATE tmnt_source_control
         SET direction = ?1, subbasin = ?2, variable = ?3, activity = ?4, \"order\" = ?5,
             percent_reduction = ?6, updated_by = ?7, updated_at = ?8
         WHERE id = ?9",
        params![
            merged.direction,
            merged.subbasin,
            merged.variable,
            merged.activity,
            merged.order,
            merged.percent_reduction,
            updated_by,
            time::now_epoch_z(),
            id
        ],
    )
    .map_err(|e| map_unique_violation(e, &merged))?;
    get_rule(conn, id)?.ok_or_else(|| StormError::NotFound(format!("source control rule id={}", id)))
}

/// All rules, optionally for one direction, in scope then application order.
pub fn list_rules(
    conn: &Connection,
    direction: Option<Direction>,
) -> Result<Vec<SourceControlRule>, StormError> {
    let sql = format!(
        "SELECT {} FROM {} WHERE (?1 IS NULL OR direction = ?1)
         ORDER BY direction, subbasin, variable, \"order\" IS NULL, \"order\", id",
        RULE_COLUMNS,
        schemas::RULE_TABLE
    );
    let mut stmt = conn.prepare(&sql)?;
    let rules = stmt
        .query_map(params![direction], rule_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rules)
}

pub fn create_rule(store: &Store, rule: &NewRule, updated_by: &str) -> Result<i64, StormError> {
    let broker = DbBroker::new(store);
    broker.with_write(updated_by, "catalog.rule_create", |conn| {
        insert_rule(conn, rule, updated_by)
    })
}

pub fn patch_rule(
    store: &Store,
    id: i64,
    patch: &RulePatch,
    updated_by: &str,
) -> Result<SourceControlRule, StormError> {
    let broker = DbBroker::new(store);
    broker.with_write(updated_by, "catalog.rule_patch", |conn| {
        update_rule(conn, id, patch, updated_by)
    })
}

pub fn delete_rule(store: &Store, id: i64, actor: &str) -> Result<(), StormError> {
    let broker = DbBroker::new(store);
    broker.with_write(actor, "catalog.rule_delete", |conn| {
        let n = conn.execute("DELETE FROM tmnt_source_control WHERE id = ?1", params![id])?;
        if n == 0 {
            return Err(StormError::NotFound(format!("source control rule id={}", id)));
        }
        Ok(())
    })
}

pub fn all_rules(store: &Store, direction: Option<Direction>) -> Result<Vec<SourceControlRule>, StormError> {
    DbBroker::new(store).with_read(|conn| list_rules(conn, direction))
}
