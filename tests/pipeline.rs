use stormledger::core::broker::{DbBroker, read_audit_log};
use stormledger::core::error::StormError;
use stormledger::core::store::Store;
use stormledger::subsystems::baseline;
use stormledger::subsystems::catalog::{self, NewRule, RulePatch};
use stormledger::subsystems::initialize_store;
use stormledger::subsystems::materialize::{self, ledger_digest, load_results};
use stormledger::subsystems::model::{BaselineRow, Direction, LedgerEntry, NetworkNode};
use stormledger::subsystems::pipeline::{
    CancelFlag, RunContext, compute_direction, recompute_if_dirty, run_pipeline, snapshot_direction,
};
use stormledger::subsystems::staleness::check_staleness;
use tempfile::TempDir;

fn seeded_store() -> (TempDir, Store) {
    let tmp = TempDir::new().unwrap();
    let store = Store::new(tmp.path().join(".stormledger"));
    initialize_store(&store).unwrap();

    for (node, subbasin) in [("N1", "S1"), ("N2", "S1"), ("N3", "S2")] {
        baseline::upsert_node(
            &store,
            &NetworkNode {
                node_id: node.to_string(),
                subbasin: subbasin.to_string(),
                basinname: Some("Lower Creek".to_string()),
            },
            "loader",
        )
        .unwrap();
    }
    for direction in Direction::ALL {
        let rows: Vec<BaselineRow> = ["N1", "N2", "N3"]
            .iter()
            .map(|node| BaselineRow {
                node_id: node.to_string(),
                epoch: "1980s".to_string(),
                variable: "TSS".to_string(),
                value: 100.0,
                units: "lbs".to_string(),
            })
            .collect();
        baseline::refresh_baselines(&store, direction, &rows, "loader").unwrap();
    }

    for (activity, order, pct) in [("sweeping", Some(1), 20.0), ("filter", Some(2), 50.0)] {
        catalog::create_rule(
            &store,
            &NewRule {
                direction: Direction::Downstream,
                subbasin: "S1".to_string(),
                variable: "TSS".to_string(),
                activity: activity.to_string(),
                order,
                percent_reduction: pct,
            },
            "admin",
        )
        .unwrap();
    }
    catalog::create_rule(
        &store,
        &NewRule {
            direction: Direction::Upstream,
            subbasin: "S2".to_string(),
            variable: "TSS".to_string(),
            activity: "inlet filters".to_string(),
            order: None,
            percent_reduction: 10.0,
        },
        "admin",
    )
    .unwrap();
    (tmp, store)
}

fn add_rule(
    store: &Store,
    direction: Direction,
    subbasin: &str,
    activity: &str,
    order: Option<i64>,
    pct: f64,
) {
    catalog::create_rule(
        store,
        &NewRule {
            direction,
            subbasin: subbasin.to_string(),
            variable: "TSS".to_string(),
            activity: activity.to_string(),
            order,
            percent_reduction: pct,
        },
        "admin",
    )
    .unwrap();
}

fn stored(store: &Store, direction: Direction, node_id: Option<&str>) -> Vec<LedgerEntry> {
    DbBroker::new(store)
        .with_read(|c| load_results(c, direction, node_id, None))
        .unwrap()
}

#[test]
fn full_run_materializes_both_directions() {
    let (_tmp, store) = seeded_store();
    let summary = run_pipeline(&RunContext::new(store.clone(), "runner")).unwrap();
    assert_eq!(summary.directions.len(), 2);
    assert_eq!(summary.rows_written(), 5);

    let down = summary
        .directions
        .iter()
        .find(|d| d.direction == Direction::Downstream)
        .unwrap();
    assert_eq!(down.scopes, 3);
    assert_eq!(down.scopes_reduced, 2);

    let ledger = materialize::results_for_node(&store, "N1", Some("1980s")).unwrap();
    assert!(!ledger.stale);
    assert_eq!(ledger.rows.len(), 2);
    assert_eq!(ledger.rows[1].value_remaining, 40.0);

    let n3 = materialize::results_for_node(&store, "N3", None).unwrap();
    assert_eq!(n3.rows.len(), 1);
    assert_eq!(n3.rows[0].direction, Direction::Upstream);
    assert_eq!(n3.rows[0].value_remaining, 90.0);
}

#[test]
fn repeated_runs_produce_identical_ledgers() {
    let (_tmp, store) = seeded_store();
    let ctx = RunContext::new(store.clone(), "runner");
    let broker = DbBroker::new(&store);

    run_pipeline(&ctx).unwrap();
    let first = broker.with_read(|c| ledger_digest(c, Direction::Downstream)).unwrap();
    run_pipeline(&ctx).unwrap();
    let second = broker.with_read(|c| ledger_digest(c, Direction::Downstream)).unwrap();
    assert_eq!(first, second);
}

#[test]
fn dedicated_worker_pool_gives_the_same_result() {
    let (_tmp, store) = seeded_store();
    let broker = DbBroker::new(&store);
    run_pipeline(&RunContext::new(store.clone(), "runner")).unwrap();
    let shared = broker.with_read(|c| ledger_digest(c, Direction::Downstream)).unwrap();

    let mut ctx = RunContext::new(store.clone(), "runner");
    ctx.threads = 2;
    run_pipeline(&ctx).unwrap();
    let dedicated = broker.with_read(|c| ledger_digest(c, Direction::Downstream)).unwrap();
    assert_eq!(shared, dedicated);
}

#[test]
fn cancelled_run_leaves_previous_results() {
    let (_tmp, store) = seeded_store();
    let broker = DbBroker::new(&store);
    run_pipeline(&RunContext::new(store.clone(), "runner")).unwrap();
    let before = broker.with_read(|c| ledger_digest(c, Direction::Downstream)).unwrap();

    catalog::delete_rule(&store, 1, "admin").unwrap();
    let cancel = CancelFlag::new();
    cancel.cancel();
    let ctx = RunContext::new(store.clone(), "runner").with_cancel(cancel);
    assert!(matches!(run_pipeline(&ctx), Err(StormError::Cancelled)));

    let after = broker.with_read(|c| ledger_digest(c, Direction::Downstream)).unwrap();
    assert_eq!(before, after);
}

#[test]
fn invalid_rule_aborts_without_swapping_anything() {
    let (_tmp, store) = seeded_store();
    let broker = DbBroker::new(&store);
    run_pipeline(&RunContext::new(store.clone(), "runner")).unwrap();
    let up_before = broker.with_read(|c| ledger_digest(c, Direction::Upstream)).unwrap();
    let down_before = broker.with_read(|c| ledger_digest(c, Direction::Downstream)).unwrap();

    // Rows written behind the catalog's back are only caught at compute time.
    broker
        .with_write("test", "corrupt", |conn| {
            conn.execute(
                "UPDATE tmnt_source_control SET percent_reduction = -5 WHERE activity = 'filter'",
                [],
            )?;
            Ok(())
        })
        .unwrap();

    match run_pipeline(&RunContext::new(store.clone(), "runner")).unwrap_err() {
        StormError::InvalidRuleData { scope, activity, .. } => {
            assert_eq!(activity, "filter");
            assert!(scope.contains("node_id=N1"));
            assert!(scope.contains("direction=downstream"));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    assert_eq!(up_before, broker.with_read(|c| ledger_digest(c, Direction::Upstream)).unwrap());
    assert_eq!(down_before, broker.with_read(|c| ledger_digest(c, Direction::Downstream)).unwrap());
}

#[test]
fn scoped_run_touches_only_requested_direction() {
    let (_tmp, store) = seeded_store();
    let ctx = RunContext::new(store.clone(), "runner").with_directions(&[Direction::Upstream]);
    let summary = run_pipeline(&ctx).unwrap();
    assert_eq!(summary.directions.len(), 1);

    let down = DbBroker::new(&store)
        .with_read(|c| load_results(c, Direction::Downstream, None, None))
        .unwrap();
    assert!(down.is_empty());
}

#[test]
fn recompute_if_dirty_skips_fresh_tables() {
    let (_tmp, store) = seeded_store();
    let ctx = RunContext::new(store.clone(), "runner");

    let first = recompute_if_dirty(&ctx).unwrap().expect("never materialized");
    assert_eq!(first.directions.len(), 2);
    assert!(recompute_if_dirty(&ctx).unwrap().is_none());

    baseline::insert_baseline(
        &store,
        Direction::Upstream,
        &BaselineRow {
            node_id: "N3".to_string(),
            epoch: "2020s".to_string(),
            variable: "TSS".to_string(),
            value: 10.0,
            units: "lbs".to_string(),
        },
        "loader",
    )
    .unwrap();
    let rerun = recompute_if_dirty(&ctx).unwrap().expect("upstream is stale");
    assert_eq!(rerun.directions.len(), 1);
    assert_eq!(rerun.directions[0].direction, Direction::Upstream);
    assert_eq!(rerun.directions[0].rows_written, 2);
}

#[test]
fn orphan_baselines_are_skipped_and_reported() {
    let (_tmp, store) = seeded_store();
    baseline::insert_baseline(
        &store,
        Direction::Upstream,
        &BaselineRow {
            node_id: "GHOST".to_string(),
            epoch: "1980s".to_string(),
            variable: "TSS".to_string(),
            value: 1.0,
            units: "lbs".to_string(),
        },
        "loader",
    )
    .unwrap();
    let summary = run_pipeline(&RunContext::new(store.clone(), "runner")).unwrap();
    let up = summary
        .directions
        .iter()
        .find(|d| d.direction == Direction::Upstream)
        .unwrap();
    assert_eq!(up.orphan_nodes, vec!["GHOST".to_string()]);
    assert!(matches!(
        materialize::results_for_node(&store, "GHOST", None),
        Err(StormError::NotFound(_))
    ));
}

#[test]
fn swaps_are_audited_under_the_run_actor() {
    let (_tmp, store) = seeded_store();
    run_pipeline(&RunContext::new(store.clone(), "runner")).unwrap();
    let ops: Vec<String> = read_audit_log(&store)
        .unwrap()
        .into_iter()
        .filter(|e| e.actor == "runner")
        .map(|e| e.op)
        .collect();
    assert_eq!(ops, vec!["results.replace_upstream", "results.replace_downstream"]);
}

#[test]
fn null_order_ties_are_stored_in_application_order() {
    let (_tmp, store) = seeded_store();
    // Insertion order and alphabetical order disagree on purpose.
    add_rule(&store, Direction::Downstream, "S2", "zeta", None, 50.0);
    add_rule(&store, Direction::Downstream, "S2", "alpha", None, 10.0);
    run_pipeline(&RunContext::new(store.clone(), "runner")).unwrap();

    let rows = stored(&store, Direction::Downstream, Some("N3"));
    let chain: Vec<(&str, f64, f64, i64)> = rows
        .iter()
        .map(|r| (r.activity.as_str(), r.value_remaining_prev, r.value_remaining, r.step))
        .collect();
    assert_eq!(chain, vec![("zeta", 100.0, 50.0, 1), ("alpha", 50.0, 45.0, 2)]);
}

#[test]
fn stored_rows_chain_within_every_scope() {
    let (_tmp, store) = seeded_store();
    add_rule(&store, Direction::Downstream, "S1", "wetland", None, 30.0);
    add_rule(&store, Direction::Downstream, "S1", "bioswale", None, 15.0);
    add_rule(&store, Direction::Upstream, "S2", "cistern", Some(1), 5.0);
    add_rule(&store, Direction::Upstream, "S2", "berm", None, 25.0);
    run_pipeline(&RunContext::new(store.clone(), "runner")).unwrap();

    for direction in Direction::ALL {
        let rows = stored(&store, direction, None);
        assert!(!rows.is_empty());
        for (i, row) in rows.iter().enumerate() {
            let continues = i > 0 && {
                let prev = &rows[i - 1];
                (&prev.node_id, &prev.subbasin, &prev.variable, &prev.epoch)
                    == (&row.node_id, &row.subbasin, &row.variable, &row.epoch)
            };
            if continues {
                assert_eq!(row.value_remaining_prev, rows[i - 1].value_remaining, "{row:?}");
                assert_eq!(row.step, rows[i - 1].step + 1);
            } else {
                assert_eq!(Some(row.value_remaining_prev), row.value, "{row:?}");
                assert_eq!(row.step, 1);
            }
        }
    }
}

#[test]
fn inputs_edited_mid_run_leave_the_ledger_dirty() {
    let (_tmp, store) = seeded_store();
    let snapshot = snapshot_direction(&store, Direction::Downstream).unwrap();
    let computed = compute_direction(
        Direction::Downstream,
        &snapshot.rules,
        &snapshot.baselines,
        &CancelFlag::new(),
    )
    .unwrap();

    let patch = RulePatch {
        percent_reduction: Some(90.0),
        ..RulePatch::default()
    };
    catalog::patch_rule(&store, 2, &patch, "admin").unwrap();

    materialize::materialize_as_of(
        &store,
        Direction::Downstream,
        &computed.rows,
        Some(snapshot.inputs_version),
        "runner",
    )
    .unwrap();
    let filter = stored(&store, Direction::Downstream, Some("N1"))
        .into_iter()
        .find(|r| r.activity == "filter")
        .unwrap();
    assert_eq!(filter.percent_reduction, 50.0);

    let report = check_staleness(&store, Direction::Downstream.result_table(), None).unwrap();
    assert!(report.is_dirty);
    assert_eq!(report.newer_dependents, vec!["tmnt_source_control".to_string()]);

    let ctx = RunContext::new(store.clone(), "runner").with_directions(&[Direction::Downstream]);
    recompute_if_dirty(&ctx).unwrap().expect("ledger built from stale rules");
    let filter = stored(&store, Direction::Downstream, Some("N1"))
        .into_iter()
        .find(|r| r.activity == "filter")
        .unwrap();
    assert_eq!(filter.percent_reduction, 90.0);
    assert!(recompute_if_dirty(&ctx).unwrap().is_none());
}
