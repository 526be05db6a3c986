//! Compact output rendering helpers for CLI surfaces.
//!
//! Keeps command result output bounded and readable while preserving signal.

use crate::subsystems::model::LedgerEntry;

/// Collapse newlines/extra whitespace and bound length for terminal display.
pub fn compact_line(input: &str, max_chars: usize) -> String {
    let collapsed = input.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut chars = collapsed.chars();
    let preview: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", preview)
    } else {
        preview
    }
}

/// Trim trailing zeros so loads read as `40` or `12.5`, not `40.000000`.
pub fn format_load(value: f64) -> String {
    let s = format!("{:.6}", value);
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s == "-0" { "0".to_string() } else { s.to_string() }
}

/// One line per ledger step, grouped visually by scope.
pub fn render_ledger(rows: &[LedgerEntry]) -> String {
    let mut out = String::new();
    let mut last_scope: Option<(&str, &str, &str, &str)> = None;
    for row in rows {
        let scope = (
            row.direction.as_str(),
            row.node_id.as_str(),
            row.variable.as_str(),
            row.epoch.as_str(),
        );
        if last_scope != Some(scope) {
            out.push_str(&format!(
                "{} node={} subbasin={} variable={} epoch={}\n",
                row.direction, row.node_id, row.subbasin, row.variable, row.epoch
            ));
            last_scope = Some(scope);
        }
        let order = row
            .order
            .map(|o| o.to_string())
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "  [{}] {:<28} {:>6}%  {} -> {}  (reduced {}{})\n",
            order,
            compact_line(&row.activity, 28),
            format_load(row.percent_reduction),
            format_load(row.value_remaining_prev),
            format_load(row.value_remaining),
            format_load(row.load_reduced),
            row.units
                .as_deref()
                .map(|u| format!(" {}", u))
                .unwrap_or_default(),
        ));
    }
    out
}
