//! # Rule Traces
//!
//! Per-rule trace entries and the deterministic reasoning string.
//!
//! One entry is recorded per fired rule, and per rule whose condition failed
//! evaluation (demoted to non-firing). The reasoning string renders fired
//! entries one per line behind a checkmark glyph; a verbose rendering also
//! shows non-firing entries behind a cross glyph with the failure kind.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// What one rule did during a `reason` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleTraceEntry {
    pub rule_id: String,

    /// Normalized condition text.
    pub condition: String,

    pub fired: bool,

    /// Field bindings the evaluation actually read.
    pub inputs: BTreeMap<String, Value>,

    /// Writes performed, in action order.
    pub writes: Vec<(String, Value)>,

    /// Set when the rule was reached through a trigger edge.
    pub triggered_by: Option<String>,

    /// Failure kind (`UndefinedField`, `TypeError`, ...) for entries that
    /// did not fire because evaluation failed.
    pub error: Option<String>,

    /// Names of impure functions the evaluation called.
    pub impure_calls: Vec<String>,
}

impl RuleTraceEntry {
    pub fn fired(rule_id: &str, condition: &str) -> Self {
        RuleTraceEntry {
            rule_id: rule_id.to_string(),
            condition: condition.to_string(),
            fired: true,
            inputs: BTreeMap::new(),
            writes: Vec::new(),
            triggered_by: None,
            error: None,
            impure_calls: Vec::new(),
        }
    }

    pub fn not_fired(rule_id: &str, condition: &str) -> Self {
        RuleTraceEntry {
            fired: false,
            ..RuleTraceEntry::fired(rule_id, condition)
        }
    }
}

/// Render the reasoning string: one line per fired rule, of the form
/// `✓ <id>: <condition>, set <k>=<v>, ...` with `(triggered by <parent>)`
/// appended when applicable. With `verbose`, non-firing entries render as
/// `✗ <id>: <condition> [<error kind>]`.
pub fn render_reasoning(entries: &[RuleTraceEntry], verbose: bool) -> String {
    let mut out = String::new();
    for entry in entries {
        if entry.fired {
            let _ = write!(out, "✓ {}: {}", entry.rule_id, entry.condition);
            for (i, (field, value)) in entry.writes.iter().enumerate() {
                if i == 0 {
                    let _ = write!(out, ", set {field}={value}");
                } else {
                    let _ = write!(out, ", {field}={value}");
                }
            }
            if let Some(parent) = &entry.triggered_by {
                let _ = write!(out, " (triggered by {parent})");
            }
            out.push('\n');
        } else if verbose {
            let _ = write!(out, "✗ {}: {}", entry.rule_id, entry.condition);
            if let Some(kind) = &entry.error {
                let _ = write!(out, " [{kind}]");
            }
            out.push('\n');
        }
    }
    out
}
