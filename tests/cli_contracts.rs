use regex::Regex;
use serde_json::Value;
use std::path::Path;
use std::process::Command;
use tempfile::TempDir;

fn run_stormledger(dir: &Path, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_stormledger"))
        .current_dir(dir)
        .env("STORMLEDGER_ROOT", dir.join(".stormledger"))
        .env_remove("RUST_LOG")
        .args(args)
        .output()
        .expect("failed to execute stormledger")
}

fn run_ok(dir: &Path, args: &[&str]) -> String {
    let output = run_stormledger(dir, args);
    assert!(
        output.status.success(),
        "stormledger {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn run_json(dir: &Path, args: &[&str]) -> Value {
    let mut full = vec!["--format", "json"];
    full.extend_from_slice(args);
    serde_json::from_str(&run_ok(dir, &full)).expect("json envelope")
}

#[test]
fn help_lists_every_command() {
    let tmp = TempDir::new().unwrap();
    let help = run_ok(tmp.path(), &["--help"]);
    for command in ["init", "rule", "node", "baseline", "recompute", "results", "dirty"] {
        let re = Regex::new(&format!(r"(?m)^\s+{}\s+", regex::escape(command)))
            .expect("valid help regex");
        assert!(re.is_match(&help), "--help missing command: {}", command);
    }

    let rule_help = run_ok(tmp.path(), &["rule", "--help"]);
    for command in ["add", "patch", "rm", "ls"] {
        let re = Regex::new(&format!(r"(?m)^\s+{}\s+", regex::escape(command)))
            .expect("valid help regex");
        assert!(re.is_match(&rule_help), "rule --help missing command: {}", command);
    }
}

#[test]
fn end_to_end_through_the_binary() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path();

    let init = run_json(dir, &["init"]);
    assert_eq!(init["cmd"], "init");
    assert_eq!(init["status"], "ok");

    run_ok(dir, &["node", "set", "--node-id", "N1", "--subbasin", "S1"]);
    run_ok(
        dir,
        &[
            "baseline", "add", "--direction", "downstream", "--node-id", "N1", "--epoch", "1980s",
            "--variable", "TSS", "--value", "100", "--units", "lbs",
        ],
    );
    for (activity, order, pct) in [("sweeping", "1", "20"), ("filter", "2", "50")] {
        run_ok(
            dir,
            &[
                "rule", "add", "--direction", "downstream", "--subbasin", "S1", "--variable", "tss",
                "--activity", activity, "--order", order, "--percent", pct,
            ],
        );
    }

    let dirty = run_json(dir, &["dirty"]);
    assert!(dirty["tables"].as_array().unwrap().iter().all(|t| t["is_dirty"] == true));

    let recompute = run_json(dir, &["recompute"]);
    assert_eq!(recompute["cmd"], "recompute");
    assert_eq!(recompute["summary"]["directions"].as_array().unwrap().len(), 2);

    let fresh = run_json(dir, &["recompute", "--if-dirty"]);
    assert!(fresh["summary"].is_null());

    let results = run_json(dir, &["results", "--node-id", "N1"]);
    let rows = results["ledger"]["rows"].as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1]["value_remaining"], 40.0);
    assert_eq!(results["ledger"]["stale"], false);

    let text = run_ok(dir, &["results", "--node-id", "N1"]);
    assert!(text.contains("80 -> 40"));
}

#[test]
fn unknown_node_exits_nonzero() {
    let tmp = TempDir::new().unwrap();
    let output = run_stormledger(tmp.path(), &["results", "--node-id", "nope"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("node_id=nope"));
}

#[test]
fn invalid_percent_is_rejected_by_the_cli() {
    let tmp = TempDir::new().unwrap();
    let output = run_stormledger(
        tmp.path(),
        &[
            "rule", "add", "--direction", "upstream", "--subbasin", "S1", "--variable", "TSS",
            "--activity", "x", "--percent", "120",
        ],
    );
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("outside [0, 100]"));
}

fn audit_lines(dir: &Path) -> usize {
    std::fs::read_to_string(dir.join(".stormledger").join("broker.events.jsonl"))
        .map(|s| s.lines().filter(|l| !l.trim().is_empty()).count())
        .unwrap_or(0)
}

#[test]
fn read_commands_leave_the_audit_log_untouched() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path();
    run_ok(dir, &["init"]);
    run_ok(dir, &["node", "set", "--node-id", "N1", "--subbasin", "S1"]);
    run_ok(
        dir,
        &[
            "baseline", "add", "--direction", "upstream", "--node-id", "N1", "--epoch", "1980s",
            "--variable", "TSS", "--value", "10", "--units", "lbs",
        ],
    );
    run_ok(
        dir,
        &[
            "rule", "add", "--direction", "upstream", "--subbasin", "S1", "--variable", "TSS",
            "--activity", "sweeping", "--percent", "10",
        ],
    );
    run_ok(dir, &["recompute"]);
    let before = audit_lines(dir);
    assert!(before > 0);

    run_ok(dir, &["dirty"]);
    run_ok(dir, &["results", "--node-id", "N1"]);
    run_ok(dir, &["rule", "ls"]);
    run_ok(dir, &["node", "ls"]);
    run_ok(dir, &["baseline", "ls", "--direction", "upstream"]);
    assert_eq!(audit_lines(dir), before);
}

#[test]
fn dirty_on_a_missing_store_creates_nothing() {
    let tmp = TempDir::new().unwrap();
    let report = run_json(tmp.path(), &["dirty"]);
    let tables = report["tables"].as_array().unwrap();
    assert_eq!(tables.len(), 2);
    assert!(tables.iter().all(|t| t["is_dirty"] == true && t["last_updated"].is_null()));
    assert!(!tmp.path().join(".stormledger").exists());
}
