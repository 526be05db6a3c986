//! Cascade Engine: applies a scope's ordered rules to its baseline load.
//!
//! The cascade is pure arithmetic over one scope:
//!
//! ```text
//! prev_0      = baseline
//! reduced_i   = prev_i * pct_i / 100
//! remaining_i = prev_i - reduced_i
//! prev_{i+1}  = remaining_i
//! ```
//!
//! Each step becomes one [`LedgerEntry`]. A scope either yields its whole
//! chain or nothing: every rule is validated before the first row is built.
//! A missing baseline or an empty rule set yields zero rows.

use crate::core::error::StormError;
use crate::subsystems::baseline::BaselineProvider;
use crate::subsystems::catalog::{RuleCatalog, percent_reduction_problem};
use crate::subsystems::model::{BaselineLoad, LedgerEntry, Scope, SourceControlRule};

/// Compute the ledger for `scope` from an already-fetched baseline and rules
/// in application order.
pub fn cascade(
    scope: &Scope,
    baseline: &BaselineLoad,
    rules: &[SourceControlRule],
) -> Result<Vec<LedgerEntry>, StormError> {
    if !baseline.value.is_finite() || baseline.value < 0.0 {
        return Err(StormError::InvalidBaseline {
            scope: scope.to_string(),
            reason: format!("baseline value {} must be finite and non-negative", baseline.value),
        });
    }
    for rule in rules {
        if let Some(reason) = percent_reduction_problem(rule.percent_reduction) {
            return Err(StormError::InvalidRuleData {
                scope: scope.to_string(),
                activity: rule.activity.clone(),
                reason,
            });
        }
    }

    let mut ledger = Vec::with_capacity(rules.len());
    let mut prev = baseline.value;
    for (idx, rule) in rules.iter().enumerate() {
        let (reduced, remaining) = apply_reduction(prev, rule.percent_reduction);
        ledger.push(LedgerEntry {
            node_id: scope.node_id.clone(),
            subbasin: scope.subbasin.clone(),
            basinname: baseline.basinname.clone(),
            variable: scope.variable.clone(),
            direction: scope.direction,
            epoch: scope.epoch.clone(),
            order: rule.order,
            activity: rule.activity.clone(),
            value: Some(baseline.value),
            units: Some(baseline.units.clone()),
            percent_reduction: rule.percent_reduction,
            value_remaining_prev: prev,
            value_remaining: remaining,
            load_reduced: reduced,
            step: idx as i64 + 1,
        });
        prev = remaining;
    }
    Ok(ledger)
}

/// One reduction step. `pct` must already be within [0, 100].
///
/// The reduced load is capped at `prev` so rounding cannot push the remainder
/// below zero, and a full reduction leaves exactly zero.
#[inline]
pub fn apply_reduction(prev: f64, pct: f64) -> (f64, f64) {
    let reduced = if pct >= 100.0 {
        prev
    } else {
        (prev * pct / 100.0).min(prev)
    };
    (reduced, prev - reduced)
}

/// Engine bound to a rule catalog and a baseline provider.
pub struct CascadeEngine<C, B> {
    catalog: C,
    baselines: B,
}

impl<C: RuleCatalog, B: BaselineProvider> CascadeEngine<C, B> {
    pub fn new(catalog: C, baselines: B) -> Self {
        Self { catalog, baselines }
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    pub fn baselines(&self) -> &B {
        &self.baselines
    }

    /// Ledger for one scope. A missing baseline is absorbed as an empty ledger;
    /// invalid rules or baselines fail the scope without partial output.
    pub fn compute(&self, scope: &Scope) -> Result<Vec<LedgerEntry>, StormError> {
        let baseline = match self.baselines.baseline_for(scope) {
            Ok(b) => b,
            Err(StormError::MissingBaseline { .. }) => {
                tracing::debug!(%scope, "no baseline load, nothing to reduce");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let rules = self
            .catalog
            .rules_for(scope.direction, &scope.subbasin, &scope.variable)
            .map_err(|e| match e {
                // Catalog errors only know the rule scope; name the full one.
                StormError::InvalidRuleData {
                    activity, reason, ..
                } => StormError::InvalidRuleData {
                    scope: scope.to_string(),
                    activity,
                    reason,
                },
                other => other,
            })?;

        cascade(scope, &baseline, &rules)
    }
}
