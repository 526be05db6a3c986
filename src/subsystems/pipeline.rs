//! Full recomputation: snapshot inputs, cascade every scope, swap results.
//!
//! A run owns an explicit [`RunContext`]; nothing is shared between runs
//! except the pool's per-DB write lock. For each requested direction the
//! rule catalog and baselines are read in one snapshot transaction, scopes
//! are computed in parallel (they are independent), and only once every
//! direction has a complete ledger are the result tables swapped. A
//! cancellation or a scope failure before that point writes nothing.

use crate::core::broker::DbBroker;
use crate::core::config::StormConfig;
use crate::core::error::StormError;
use crate::core::store::Store;
use crate::core::time;
use crate::subsystems::baseline::BaselineSnapshot;
use crate::subsystems::cascade::CascadeEngine;
use crate::subsystems::catalog::RuleSnapshot;
use crate::subsystems::materialize;
use crate::subsystems::model::{Direction, LedgerEntry, Scope};
use crate::subsystems::staleness;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cooperative cancellation shared between a run and whoever may abort it.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything one pipeline run needs, passed explicitly to each stage.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub store: Store,
    pub actor: String,
    pub cancel: CancelFlag,
    pub directions: Vec<Direction>,
    /// Worker threads for scope computation; 0 uses the global rayon pool.
    pub threads: usize,
}

impl RunContext {
    pub fn new(store: Store, actor: impl Into<String>) -> Self {
        Self {
            store,
            actor: actor.into(),
            cancel: CancelFlag::new(),
            directions: Direction::ALL.to_vec(),
            threads: 0,
        }
    }

    pub fn from_config(config: &StormConfig) -> Self {
        let mut ctx = Self::new(config.store(), config.pipeline.actor.clone());
        ctx.threads = config.pipeline.threads;
        ctx
    }

    pub fn with_directions(mut self, directions: &[Direction]) -> Self {
        self.directions = directions.to_vec();
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectionSummary {
    pub direction: Direction,
    pub table: String,
    /// Scopes that had a baseline load.
    pub scopes: usize,
    /// Scopes that produced at least one ledger row.
    pub scopes_reduced: usize,
    pub rows_written: usize,
    /// Nodes with baseline rows but no network membership.
    pub orphan_nodes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub run_id: String,
    pub directions: Vec<DirectionSummary>,
}

impl PipelineSummary {
    pub fn rows_written(&self) -> usize {
        self.directions.iter().map(|d| d.rows_written).sum()
    }
}

/// Ledger for one direction, computed but not yet stored.
#[derive(Debug, Clone)]
pub struct ComputedDirection {
    pub direction: Direction,
    pub rows: Vec<LedgerEntry>,
    pub scopes: usize,
    pub scopes_reduced: usize,
    pub orphan_nodes: Vec<String>,
}

/// Cascade every scope of one direction's snapshot. Scopes run in parallel;
/// the first failing scope (in sorted scope order) fails the direction.
pub fn compute_direction(
    direction: Direction,
    rules: &RuleSnapshot,
    baselines: &BaselineSnapshot,
    cancel: &CancelFlag,
) -> Result<ComputedDirection, StormError> {
    let engine = CascadeEngine::new(rules, baselines);
    let scopes: Vec<&Scope> = baselines.scopes().collect();

    let outcomes: Vec<Result<Vec<LedgerEntry>, StormError>> = scopes
        .par_iter()
        .map(|scope| {
            if cancel.is_cancelled() {
                return Err(StormError::Cancelled);
            }
            let rows = engine.compute(scope)?;
            tracing::debug!(%scope, rows = rows.len(), "scope computed");
            Ok(rows)
        })
        .collect();

    let mut rows = Vec::new();
    let mut scopes_reduced = 0;
    let mut first_failure = None;
    for (scope, outcome) in scopes.iter().zip(outcomes) {
        match outcome {
            Ok(ledger) => {
                if !ledger.is_empty() {
                    scopes_reduced += 1;
                }
                rows.extend(ledger);
            }
            Err(StormError::Cancelled) => return Err(StormError::Cancelled),
            Err(e) if e.is_scope_fatal() => {
                tracing::error!(%scope, error = %e, "scope failed");
                if first_failure.is_none() {
                    first_failure = Some(e);
                }
            }
            Err(e) => return Err(e),
        }
    }
    if let Some(e) = first_failure {
        return Err(e);
    }

    Ok(ComputedDirection {
        direction,
        rows,
        scopes: scopes.len(),
        scopes_reduced,
        orphan_nodes: baselines.orphan_nodes.clone(),
    })
}

/// Everything one direction is computed from, read in a single transaction.
#[derive(Debug, Clone)]
pub struct DirectionSnapshot {
    pub rules: RuleSnapshot,
    pub baselines: BaselineSnapshot,
    /// Change-clock tick the inputs were read at.
    pub inputs_version: i64,
}

pub fn snapshot_direction(
    store: &Store,
    direction: Direction,
) -> Result<DirectionSnapshot, StormError> {
    DbBroker::new(store).with_read(|conn| {
        let tx = conn.unchecked_transaction()?;
        let inputs_version = staleness::current_tick(&tx)?;
        let rules = RuleSnapshot::load(&tx, Some(direction))?;
        let baselines = BaselineSnapshot::load(&tx, direction)?;
        Ok(DirectionSnapshot {
            rules,
            baselines,
            inputs_version,
        })
    })
}

fn run_in_context(ctx: &RunContext) -> Result<PipelineSummary, StormError> {
    let run_id = time::new_event_id();
    tracing::info!(%run_id, directions = ?ctx.directions, "pipeline run started");

    let mut computed = Vec::with_capacity(ctx.directions.len());
    for &direction in &ctx.directions {
        let DirectionSnapshot {
            rules,
            baselines,
            inputs_version,
        } = snapshot_direction(&ctx.store, direction)?;
        if !baselines.orphan_nodes.is_empty() {
            tracing::warn!(
                %direction,
                nodes = ?baselines.orphan_nodes,
                "baseline rows without network membership skipped"
            );
        }
        tracing::info!(
            %direction,
            rules = rules.rule_count(),
            scopes = baselines.len(),
            inputs_version,
            "inputs snapshotted"
        );
        let c = compute_direction(direction, &rules, &baselines, &ctx.cancel)?;
        computed.push((c, inputs_version));
    }

    if ctx.cancel.is_cancelled() {
        tracing::warn!(%run_id, "pipeline cancelled before swap");
        return Err(StormError::Cancelled);
    }

    let mut summaries = Vec::with_capacity(computed.len());
    for (c, inputs_version) in computed {
        let written = materialize::materialize_as_of(
            &ctx.store,
            c.direction,
            &c.rows,
            Some(inputs_version),
            &ctx.actor,
        )?;
        summaries.push(DirectionSummary {
            direction: c.direction,
            table: c.direction.result_table().to_string(),
            scopes: c.scopes,
            scopes_reduced: c.scopes_reduced,
            rows_written: written,
            orphan_nodes: c.orphan_nodes,
        });
    }

    tracing::info!(%run_id, "pipeline run finished");
    Ok(PipelineSummary {
        run_id,
        directions: summaries,
    })
}

/// Recompute and replace the ledger tables for every direction in `ctx`.
pub fn run_pipeline(ctx: &RunContext) -> Result<PipelineSummary, StormError> {
    if ctx.threads == 0 {
        return run_in_context(ctx);
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(ctx.threads)
        .build()
        .map_err(|e| StormError::ConfigError(format!("cannot build worker pool: {}", e)))?;
    pool.install(|| run_in_context(ctx))
}

/// Run the pipeline only for directions whose ledger table is stale.
/// Returns `None` when everything is fresh.
pub fn recompute_if_dirty(ctx: &RunContext) -> Result<Option<PipelineSummary>, StormError> {
    let broker = DbBroker::new(&ctx.store);
    let dirty: Vec<Direction> = broker.with_read(|conn| {
        let mut dirty = Vec::new();
        for &direction in &ctx.directions {
            if staleness::is_dirty(conn, direction.result_table(), None)? {
                dirty.push(direction);
            }
        }
        Ok(dirty)
    })?;

    if dirty.is_empty() {
        tracing::info!("ledger tables are fresh, nothing to recompute");
        return Ok(None);
    }
    let scoped = ctx.clone().with_directions(&dirty);
    run_pipeline(&scoped).map(Some)
}
