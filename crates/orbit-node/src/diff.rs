//! Structural comparison of configuration documents.
//!
//! The diff walks the union of object keys level by level. Arrays are
//! compared by serialized equality and reported as a single
//! modification; there is no element-level recursion into them, since
//! collection order is semantically significant.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// What happened to one dotted path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
}

/// One change record, dotted from the document root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigChange {
    pub path: String,
    pub kind: ChangeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
}

/// An ordered list of changes between two documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffReport {
    pub changes: Vec<ConfigChange>,
    pub has_changes: bool,
}

/// Compare two documents.
pub fn diff_documents(old: &Value, new: &Value) -> DiffReport {
    let mut changes = Vec::new();
    diff_value("", old, new, &mut changes);
    DiffReport {
        has_changes: !changes.is_empty(),
        changes,
    }
}

fn diff_value(path: &str, old: &Value, new: &Value, out: &mut Vec<ConfigChange>) {
    match (old.as_object(), new.as_object()) {
        (Some(old_obj), Some(new_obj)) => {
            let keys: BTreeSet<&String> = old_obj.keys().chain(new_obj.keys()).collect();
            for key in keys {
                let child_path = if path.is_empty() {
                    key.to_string()
                } else {
                    format!("{}.{}", path, key)
                };
                match (old_obj.get(key.as_str()), new_obj.get(key.as_str())) {
                    (None, Some(new_value)) => out.push(ConfigChange {
                        path: child_path,
                        kind: ChangeKind::Added,
                        old_value: None,
                        new_value: Some(new_value.clone()),
                    }),
                    (Some(old_value), None) => out.push(ConfigChange {
                        path: child_path,
                        kind: ChangeKind::Removed,
                        old_value: Some(old_value.clone()),
                        new_value: None,
                    }),
                    (Some(old_value), Some(new_value)) => {
                        diff_leaf(&child_path, old_value, new_value, out);
                    }
                    (None, None) => {}
                }
            }
        }
        _ => diff_leaf(path, old, new, out),
    }
}

fn diff_leaf(path: &str, old: &Value, new: &Value, out: &mut Vec<ConfigChange>) {
    if old.is_array() && new.is_array() {
        // Serialized equality; a difference reports both arrays whole.
        if serde_json::to_string(old).ok() != serde_json::to_string(new).ok() {
            out.push(ConfigChange {
                path: path.to_string(),
                kind: ChangeKind::Modified,
                old_value: Some(old.clone()),
                new_value: Some(new.clone()),
            });
        }
        return;
    }
    if old.is_object() && new.is_object() {
        diff_value(path, old, new, out);
        return;
    }
    if old != new {
        out.push(ConfigChange {
            path: path.to_string(),
            kind: ChangeKind::Modified,
            old_value: Some(old.clone()),
            new_value: Some(new.clone()),
        });
    }
}

/// One human-readable line per change, for text-mode rendering.
pub fn render_changes(report: &DiffReport) -> String {
    report
        .changes
        .iter()
        .map(|change| {
            let symbol = match change.kind {
                ChangeKind::Added => '+',
                ChangeKind::Removed => '-',
                ChangeKind::Modified => '~',
            };
            format!("{} {}", symbol, change.path)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
