//! Subsystems: the rule catalog, baselines, the cascade, materialized
//! ledgers, staleness tracking and the pipeline that ties them together.
//!
//! Adding a subsystem with tables of its own: append one entry to `SUBSYSTEMS`.

pub mod baseline;
pub mod cascade;
pub mod catalog;
pub mod materialize;
pub mod model;
pub mod pipeline;
pub mod staleness;

use crate::core::db;
use crate::core::error::StormError;
use crate::core::store::Store;

pub struct SubsystemInit {
    pub name: &'static str,
    pub initialize_db: fn(&Store) -> Result<(), StormError>,
}

/// Initialization order matters: the change log must exist before any
/// trigger that writes to it is created.
pub const SUBSYSTEMS: &[SubsystemInit] = &[
    SubsystemInit { name: "staleness", initialize_db: staleness::initialize_staleness_db },
    SubsystemInit { name: "baseline", initialize_db: baseline::initialize_baseline_db },
    SubsystemInit { name: "catalog", initialize_db: catalog::initialize_catalog_db },
    SubsystemInit { name: "results", initialize_db: materialize::initialize_results_db },
];

/// Create the store directory and every table. Safe to run repeatedly.
pub fn initialize_store(store: &Store) -> Result<(), StormError> {
    db::storage_health_preflight(&store.root)?;
    for sub in SUBSYSTEMS {
        tracing::debug!(subsystem = sub.name, "initializing tables");
        (sub.initialize_db)(store)?;
    }
    Ok(())
}
