//! Stormledger: source-control load reduction for stormwater networks.
//!
//! For every (node, subbasin, variable, direction, epoch) scope, a baseline
//! pollutant load is reduced by an ordered chain of source-control rules,
//! each removing a percentage of whatever the previous step left. Each
//! step is stored as one ledger row, so the effect of every intervention
//! stays attributable.
//!
//! # Architecture
//!
//! ## The Thin Waist
//!
//! All state lives in one SQLite database per store. Every mutation routes
//! through `DbBroker`, which serializes writers per database and appends an
//! entry to `broker.events.jsonl`. Reads go straight to a connection.
//!
//! ## Subsystems
//!
//! - `catalog`: the ordered rule catalog and its admin operations
//! - `baseline`: network membership and baseline loads per direction
//! - `cascade`: the pure sequential reduction and its engine
//! - `materialize`: atomic replacement and reads of the ledger tables
//! - `staleness`: change-log driven dirty checks
//! - `pipeline`: snapshot, parallel compute, swap
//!
//! # Examples
//!
//! ```bash
//! stormledger init
//! stormledger node set --node-id N1 --subbasin S1
//! stormledger baseline add --direction upstream --node-id N1 --epoch 1980s --variable TSS --value 100 --units lbs
//! stormledger rule add --direction upstream --subbasin S1 --variable TSS --activity sweeping --order 1 --percent 20
//! stormledger recompute
//! stormledger results --node-id N1
//! ```

pub mod core;
pub mod subsystems;

use crate::core::broker::DbBroker;
use crate::core::config::{self, StormConfig};
use crate::core::error::StormError;
use crate::core::output;
use crate::core::store::Store;
use crate::core::time;
use crate::subsystems::baseline;
use crate::subsystems::catalog::{self, NewRule, RulePatch};
use crate::subsystems::materialize;
use crate::subsystems::model::{BaselineRow, Direction, NetworkNode, SourceControlRule};
use crate::subsystems::pipeline::{self, PipelineSummary, RunContext};
use crate::subsystems::staleness;

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use serde_json::json;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(
    name = "stormledger",
    version = env!("CARGO_PKG_VERSION"),
    about = "Source-control load reduction ledger for stormwater networks"
)]
struct Cli {
    /// Config file (defaults to ./stormledger.toml when present).
    #[clap(long, global = true)]
    config: Option<PathBuf>,
    /// Output format.
    #[clap(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the store and all tables.
    Init,
    /// Manage the source-control rule catalog.
    Rule(RuleCli),
    /// Manage network node membership.
    Node(NodeCli),
    /// Manage baseline loads.
    Baseline(BaselineCli),
    /// Recompute the ledger tables from the current inputs.
    Recompute {
        /// Direction to recompute; repeat for both. Defaults to both.
        #[clap(long, value_enum)]
        direction: Vec<Direction>,
        /// Skip directions whose ledger is already fresh.
        #[clap(long)]
        if_dirty: bool,
    },
    /// Show the ledger rows for one node.
    Results {
        #[clap(long)]
        node_id: String,
        #[clap(long)]
        epoch: Option<String>,
    },
    /// Report whether a derived table is stale.
    Dirty {
        /// Table to check. Defaults to both ledger tables.
        #[clap(long)]
        table: Option<String>,
        /// Comma-separated dependents, replacing the defaults.
        #[clap(long, value_delimiter = ',')]
        dependents: Option<Vec<String>>,
    },
}

impl Command {
    /// Queries that must leave the store untouched, audit log included.
    fn is_read_only(&self) -> bool {
        match self {
            Command::Results { .. } | Command::Dirty { .. } => true,
            Command::Rule(r) => matches!(r.command, RuleCommand::Ls { .. }),
            Command::Node(n) => matches!(n.command, NodeCommand::Ls),
            Command::Baseline(b) => matches!(b.command, BaselineCommand::Ls { .. }),
            Command::Init | Command::Recompute { .. } => false,
        }
    }
}

#[derive(clap::Args, Debug)]
struct RuleCli {
    #[clap(subcommand)]
    command: RuleCommand,
}

#[derive(Subcommand, Debug)]
enum RuleCommand {
    /// Add a rule.
    Add {
        #[clap(long, value_enum)]
        direction: Direction,
        #[clap(long)]
        subbasin: String,
        #[clap(long)]
        variable: String,
        #[clap(long)]
        activity: String,
        /// Application order; omit to apply after all ordered rules.
        #[clap(long)]
        order: Option<i64>,
        /// Percent of the remaining load removed, 0 to 100.
        #[clap(long)]
        percent: f64,
    },
    /// Change fields of an existing rule.
    Patch {
        #[clap(long)]
        id: i64,
        #[clap(long, value_enum)]
        direction: Option<Direction>,
        #[clap(long)]
        subbasin: Option<String>,
        #[clap(long)]
        variable: Option<String>,
        #[clap(long)]
        activity: Option<String>,
        #[clap(long, conflicts_with = "clear_order")]
        order: Option<i64>,
        /// Remove the order so the rule is applied last.
        #[clap(long)]
        clear_order: bool,
        #[clap(long)]
        percent: Option<f64>,
    },
    /// Delete a rule.
    Rm {
        #[clap(long)]
        id: i64,
    },
    /// List rules in application order.
    Ls {
        #[clap(long, value_enum)]
        direction: Option<Direction>,
    },
}

#[derive(clap::Args, Debug)]
struct NodeCli {
    #[clap(subcommand)]
    command: NodeCommand,
}

#[derive(Subcommand, Debug)]
enum NodeCommand {
    /// Insert or update a node's subbasin membership.
    Set {
        #[clap(long)]
        node_id: String,
        #[clap(long)]
        subbasin: String,
        #[clap(long)]
        basinname: Option<String>,
    },
    /// List network nodes.
    Ls,
}

#[derive(clap::Args, Debug)]
struct BaselineCli {
    #[clap(subcommand)]
    command: BaselineCommand,
}

#[derive(Subcommand, Debug)]
enum BaselineCommand {
    /// Add a baseline load row.
    Add {
        #[clap(long, value_enum)]
        direction: Direction,
        #[clap(long)]
        node_id: String,
        #[clap(long)]
        epoch: String,
        #[clap(long)]
        variable: String,
        #[clap(long)]
        value: f64,
        #[clap(long)]
        units: String,
    },
    /// List baseline rows for a direction.
    Ls {
        #[clap(long, value_enum)]
        direction: Direction,
    },
}

/// Install the global subscriber. `RUST_LOG` wins over the config filter.
/// Logs go to stderr so JSON output on stdout stays parseable.
pub fn init_tracing(config: &StormConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log.filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn run() -> Result<(), StormError> {
    let cli = Cli::parse();
    let current_dir = std::env::current_dir()?;
    let config = config::load_config(cli.config.as_deref(), &current_dir)?;
    init_tracing(&config);

    let store = config.store();
    if !cli.command.is_read_only() {
        subsystems::initialize_store(&store)?;
    }
    let format = cli.format;
    let actor = config.pipeline.actor.clone();

    match cli.command {
        Command::Init => {
            emit(format, "init", json!({ "root": store.root.display().to_string() }), || {
                println!(
                    "{} store ready at {}",
                    "✓".green(),
                    store.root.display().to_string().bold()
                );
            });
        }
        Command::Rule(rule_cli) => run_rule(&store, &actor, format, rule_cli.command)?,
        Command::Node(node_cli) => run_node(&store, &actor, format, node_cli.command)?,
        Command::Baseline(baseline_cli) => {
            run_baseline(&store, &actor, format, baseline_cli.command)?
        }
        Command::Recompute {
            direction,
            if_dirty,
        } => {
            let mut ctx = RunContext::from_config(&config);
            if !direction.is_empty() {
                ctx = ctx.with_directions(&direction);
            }
            let summary = if if_dirty {
                pipeline::recompute_if_dirty(&ctx)?
            } else {
                Some(pipeline::run_pipeline(&ctx)?)
            };
            print_summary(format, summary.as_ref())?;
        }
        Command::Results { node_id, epoch } => {
            let ledger = materialize::results_for_node(&store, &node_id, epoch.as_deref())?;
            let value = serde_json::to_value(&ledger)?;
            emit(format, "results", json!({ "ledger": value }), || {
                if ledger.stale {
                    println!(
                        "{} ledger may be out of date; run `stormledger recompute`",
                        "!".yellow().bold()
                    );
                }
                print!("{}", output::render_ledger(&ledger.rows));
            });
        }
        Command::Dirty { table, dependents } => {
            let tables = match table {
                Some(t) => vec![t],
                None => Direction::ALL
                    .iter()
                    .map(|d| d.result_table().to_string())
                    .collect(),
            };
            let mut reports = Vec::with_capacity(tables.len());
            for t in &tables {
                reports.push(staleness::check_staleness(&store, t, dependents.as_deref())?);
            }
            let value = serde_json::to_value(&reports)?;
            emit(format, "dirty", json!({ "tables": value }), || {
                for r in &reports {
                    let flag = if r.is_dirty {
                        "dirty".red().bold()
                    } else {
                        "fresh".green().bold()
                    };
                    println!(
                        "{} {} (last updated {})",
                        flag,
                        r.tablename,
                        r.last_updated.as_deref().unwrap_or("never")
                    );
                    if !r.newer_dependents.is_empty() {
                        println!("    newer: {}", r.newer_dependents.join(", "));
                    }
                }
            });
        }
    }
    Ok(())
}

/// Print the JSON envelope, or run the text renderer.
fn emit(format: OutputFormat, cmd: &str, extra: serde_json::Value, text: impl FnOnce()) {
    match format {
        OutputFormat::Json => println!("{}", time::command_envelope(cmd, "ok", extra)),
        OutputFormat::Text => text(),
    }
}

fn print_rules(rules: &[SourceControlRule]) {
    if rules.is_empty() {
        println!("no rules");
        return;
    }
    for r in rules {
        let order = r
            .order
            .map(|o| o.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:>5}  {:<10} {:<12} {:<6} [{}] {} {}%",
            r.id,
            r.direction,
            r.subbasin,
            r.variable,
            order,
            output::compact_line(&r.activity, 40),
            output::format_load(r.percent_reduction)
        );
    }
}

fn run_rule(
    store: &Store,
    actor: &str,
    format: OutputFormat,
    command: RuleCommand,
) -> Result<(), StormError> {
    match command {
        RuleCommand::Add {
            direction,
            subbasin,
            variable,
            activity,
            order,
            percent,
        } => {
            let rule = NewRule {
                direction,
                subbasin,
                variable,
                activity,
                order,
                percent_reduction: percent,
            };
            let id = catalog::create_rule(store, &rule, actor)?;
            emit(format, "rule.add", json!({ "id": id }), || {
                println!("{} rule {} added", "✓".green(), id);
            });
        }
        RuleCommand::Patch {
            id,
            direction,
            subbasin,
            variable,
            activity,
            order,
            clear_order,
            percent,
        } => {
            let patch = RulePatch {
                direction,
                subbasin,
                variable,
                activity,
                order: if clear_order { Some(None) } else { order.map(Some) },
                percent_reduction: percent,
            };
            let rule = catalog::patch_rule(store, id, &patch, actor)?;
            let value = serde_json::to_value(&rule)?;
            emit(format, "rule.patch", json!({ "rule": value }), || {
                println!("{} rule {} updated", "✓".green(), id);
                print_rules(std::slice::from_ref(&rule));
            });
        }
        RuleCommand::Rm { id } => {
            catalog::delete_rule(store, id, actor)?;
            emit(format, "rule.rm", json!({ "id": id }), || {
                println!("{} rule {} deleted", "✓".green(), id);
            });
        }
        RuleCommand::Ls { direction } => {
            let rules = catalog::all_rules(store, direction)?;
            let value = serde_json::to_value(&rules)?;
            emit(format, "rule.ls", json!({ "rules": value }), || print_rules(&rules));
        }
    }
    Ok(())
}

fn run_node(
    store: &Store,
    actor: &str,
    format: OutputFormat,
    command: NodeCommand,
) -> Result<(), StormError> {
    match command {
        NodeCommand::Set {
            node_id,
            subbasin,
            basinname,
        } => {
            let node = NetworkNode {
                node_id,
                subbasin,
                basinname,
            };
            baseline::upsert_node(store, &node, actor)?;
            emit(format, "node.set", json!({ "node_id": node.node_id }), || {
                println!("{} node {} -> {}", "✓".green(), node.node_id, node.subbasin);
            });
        }
        NodeCommand::Ls => {
            let nodes = DbBroker::new(store).with_read(baseline::list_nodes)?;
            let value = serde_json::to_value(&nodes)?;
            emit(format, "node.ls", json!({ "nodes": value }), || {
                for n in &nodes {
                    println!(
                        "{:<16} {:<12} {}",
                        n.node_id,
                        n.subbasin,
                        n.basinname.as_deref().unwrap_or("")
                    );
                }
            });
        }
    }
    Ok(())
}

fn run_baseline(
    store: &Store,
    actor: &str,
    format: OutputFormat,
    command: BaselineCommand,
) -> Result<(), StormError> {
    match command {
        BaselineCommand::Add {
            direction,
            node_id,
            epoch,
            variable,
            value,
            units,
        } => {
            let row = BaselineRow {
                node_id,
                epoch,
                variable,
                value,
                units,
            };
            baseline::insert_baseline(store, direction, &row, actor)?;
            emit(format, "baseline.add", json!({ "node_id": row.node_id }), || {
                println!(
                    "{} {} baseline for {} added",
                    "✓".green(),
                    direction,
                    row.node_id
                );
            });
        }
        BaselineCommand::Ls { direction } => {
            let rows = DbBroker::new(store)
                .with_read(|conn| baseline::list_baselines(conn, direction))?;
            let value = serde_json::to_value(&rows)?;
            emit(format, "baseline.ls", json!({ "rows": value }), || {
                for r in &rows {
                    println!(
                        "{:<16} {:<8} {:<6} {} {}",
                        r.node_id,
                        r.epoch,
                        r.variable,
                        output::format_load(r.value),
                        r.units
                    );
                }
            });
        }
    }
    Ok(())
}

fn print_summary(format: OutputFormat, summary: Option<&PipelineSummary>) -> Result<(), StormError> {
    let value = serde_json::to_value(summary)?;
    emit(format, "recompute", json!({ "summary": value }), || match summary {
        None => println!("{} ledger tables are fresh", "✓".green()),
        Some(s) => {
            for d in &s.directions {
                println!(
                    "{} {}: {} rows from {} scopes ({} reduced)",
                    "✓".green(),
                    d.table,
                    d.rows_written,
                    d.scopes,
                    d.scopes_reduced
                );
                if !d.orphan_nodes.is_empty() {
                    println!(
                        "  {} skipped nodes without network membership: {}",
                        "!".yellow(),
                        d.orphan_nodes.join(", ")
                    );
                }
            }
        }
    });
    Ok(())
}
