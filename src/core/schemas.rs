//! Centralized database schema definitions.
//!
//! All state lives in one SQLite database (`stormledger.db`) per store:
//! 1. Reference inputs: network membership, the source-control rule catalog,
//!    and one baseline load table per direction.
//! 2. Derived outputs: one ledger table per direction, fully regenerated on
//!    every pipeline run.
//! 3. Change bookkeeping: a logical clock plus a per-table change log that
//!    staleness checks read.

pub const LEDGER_DB_NAME: &str = "stormledger.db";
pub const AUDIT_LOG_NAME: &str = "broker.events.jsonl";

// --- Table names (persisted contract) ---
pub const NETWORK_NODE_TABLE: &str = "network_node";
pub const RULE_TABLE: &str = "tmnt_source_control";
pub const UPSTREAM_BASELINE_TABLE: &str = "lgu_load_to_structural";
pub const DOWNSTREAM_BASELINE_TABLE: &str = "load_to_ds_src_ctrl";
pub const UPSTREAM_RESULT_TABLE: &str = "tmnt_source_control_upstream_load_reduced";
pub const DOWNSTREAM_RESULT_TABLE: &str = "tmnt_source_control_downstream_load_reduced";
pub const CHANGE_LOG_TABLE: &str = "table_change_log";

/// Input tables whose every mutation advances the change clock.
pub const TRACKED_INPUT_TABLES: &[&str] = &[
    NETWORK_NODE_TABLE,
    RULE_TABLE,
    UPSTREAM_BASELINE_TABLE,
    DOWNSTREAM_BASELINE_TABLE,
];

// --- 1. Reference inputs ---
pub const NETWORK_NODE_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS network_node (
        node_id TEXT PRIMARY KEY,
        subbasin TEXT NOT NULL,
        basinname TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_network_node_subbasin ON network_node(subbasin);
";

pub const RULE_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS tmnt_source_control (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        node_id TEXT,
        subbasin TEXT NOT NULL,
        basinname TEXT,
        variable TEXT NOT NULL,
        \"order\" INTEGER,
        activity TEXT NOT NULL,
        direction TEXT NOT NULL CHECK (direction IN ('upstream', 'downstream')),
        epoch TEXT,
        value REAL,
        units TEXT,
        percent_reduction REAL NOT NULL,
        updated_by TEXT,
        updated_at TEXT NOT NULL,
        UNIQUE(direction, subbasin, variable, activity),
        UNIQUE(direction, subbasin, variable, \"order\")
    );
";

/// Baseline load tables share one shape; `{table}` is substituted per direction.
pub const BASELINE_SCHEMA_TEMPLATE: &str = "
    CREATE TABLE IF NOT EXISTS {table} (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        node_id TEXT NOT NULL,
        epoch TEXT NOT NULL,
        variable TEXT NOT NULL,
        value REAL NOT NULL,
        units TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_{table}_scope ON {table}(node_id, epoch, variable);
";

// --- 2. Derived outputs ---
pub const RESULT_SCHEMA_TEMPLATE: &str = "
    CREATE TABLE IF NOT EXISTS {table} (
        id INTEGER PRIMARY KEY,
        node_id TEXT NOT NULL,
        subbasin TEXT NOT NULL,
        basinname TEXT,
        variable TEXT NOT NULL,
        \"order\" INTEGER,
        activity TEXT NOT NULL,
        direction TEXT NOT NULL CHECK (direction IN ('upstream', 'downstream')),
        epoch TEXT,
        value REAL,
        units TEXT,
        percent_reduction REAL NOT NULL,
        value_remaining_prev REAL NOT NULL,
        value_remaining REAL NOT NULL,
        load_reduced REAL NOT NULL,
        step INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_{table}_node ON {table}(node_id, epoch);
";

// --- 3. Change bookkeeping ---
pub const CHANGE_LOG_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS change_clock (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        tick INTEGER NOT NULL
    );
    INSERT OR IGNORE INTO change_clock(id, tick) VALUES (1, 0);
    CREATE TABLE IF NOT EXISTS table_change_log (
        tablename TEXT PRIMARY KEY,
        version INTEGER NOT NULL,
        last_updated TEXT NOT NULL
    );
";

/// Advance the clock and stamp `{table}` with the new tick. Body of every
/// input-table change trigger.
pub const TOUCH_TABLE_SQL: &str = "
    UPDATE change_clock SET tick = tick + 1 WHERE id = 1;
    INSERT OR REPLACE INTO table_change_log(tablename, version, last_updated)
    VALUES ('{table}', (SELECT tick FROM change_clock WHERE id = 1), strftime('%Y-%m-%dT%H:%M:%fZ', 'now'));
";

pub fn baseline_schema(table: &str) -> String {
    BASELINE_SCHEMA_TEMPLATE.replace("{table}", table)
}

pub fn result_schema(table: &str) -> String {
    RESULT_SCHEMA_TEMPLATE.replace("{table}", table)
}

pub fn touch_table_sql(table: &str) -> String {
    TOUCH_TABLE_SQL.replace("{table}", table)
}

/// Row-level triggers that stamp `table` in the change log on every mutation.
pub fn change_trigger_ddl(table: &str) -> String {
    let body = touch_table_sql(table);
    ["INSERT", "UPDATE", "DELETE"]
        .iter()
        .map(|op| {
            format!(
                "CREATE TRIGGER IF NOT EXISTS trg_{table}_{lower}_changed AFTER {op} ON {table}\nBEGIN{body}END;\n",
                lower = op.to_lowercase(),
            )
        })
        .collect()
}
