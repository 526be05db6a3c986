//! Clock and id helpers for audit events, rule stamps and CLI envelopes.

use serde_json::{Map, Value as JsonValue, json};
use std::time::{SystemTime, UNIX_EPOCH};
use ulid::Ulid;

/// Seconds since the unix epoch. A clock set before 1970 reads as zero.
pub fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// `unix_seconds` as text with a `Z` suffix, e.g. `1771220592Z`. Used for
/// `updated_at` on rules and `ts` on audit events.
pub fn now_epoch_z() -> String {
    format!("{}Z", unix_seconds())
}

/// Sortable unique id for audit events and pipeline runs.
pub fn new_event_id() -> String {
    Ulid::new().to_string()
}

/// JSON envelope printed by every CLI command under `--format json`.
///
/// Object bodies are merged into the envelope; any other non-null body is
/// placed under `data`. Envelope keys win over body keys of the same name.
pub fn command_envelope(cmd: &str, status: &str, body: JsonValue) -> JsonValue {
    let mut out = match body {
        JsonValue::Object(fields) => fields,
        JsonValue::Null => Map::new(),
        other => {
            let mut m = Map::new();
            m.insert("data".to_string(), other);
            m
        }
    };
    out.insert("envelope_version".to_string(), json!("1.0.0"));
    out.insert("tool".to_string(), json!(env!("CARGO_PKG_NAME")));
    out.insert("ts".to_string(), json!(now_epoch_z()));
    out.insert("event_id".to_string(), json!(new_event_id()));
    out.insert("cmd".to_string(), json!(cmd));
    out.insert("status".to_string(), json!(status));
    JsonValue::Object(out)
}
