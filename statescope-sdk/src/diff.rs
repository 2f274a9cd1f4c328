//! Path-qualified structural diff of component state.
//!
//! Both the component change log and snapshot comparison go through
//! [`diff_states`]. Nested objects are walked and reported by dot-path
//! (`user.settings.theme`); arrays are compared as whole values, so any
//! change inside a list shows up as one change of the entire list.

use std::collections::BTreeMap;

use serde_json::Value;
use statescope_types::{PropertyChange, StateDiff, ValueChange};

/// Diff two property maps, returning only the leaf paths whose values differ.
pub fn diff_states(before: &BTreeMap<String, Value>, after: &BTreeMap<String, Value>) -> StateDiff {
    let before_leaves = flatten_state(before);
    let after_leaves = flatten_state(after);

    let mut diff = StateDiff::new();

    for (path, old) in &before_leaves {
        match after_leaves.get(path) {
            Some(new) if new == old => {}
            new => {
                diff.insert(
                    path.clone(),
                    ValueChange {
                        before: Some((*old).clone()),
                        after: new.map(|v| (*v).clone()),
                    },
                );
            }
        }
    }

    for (path, new) in &after_leaves {
        if !before_leaves.contains_key(path) {
            diff.insert(
                path.clone(),
                ValueChange {
                    before: None,
                    after: Some((*new).clone()),
                },
            );
        }
    }

    diff
}

/// Same diff, shaped as change-log entries.
pub fn property_changes(
    before: &BTreeMap<String, Value>,
    after: &BTreeMap<String, Value>,
) -> Vec<PropertyChange> {
    diff_states(before, after)
        .into_iter()
        .map(|(property, change)| PropertyChange {
            property,
            from: change.before,
            to: change.after,
        })
        .collect()
}

fn flatten_state(state: &BTreeMap<String, Value>) -> BTreeMap<String, &Value> {
    let mut leaves = BTreeMap::new();
    for (name, value) in state {
        flatten_into(name.clone(), value, &mut leaves);
    }
    leaves
}

fn flatten_into<'a>(path: String, value: &'a Value, leaves: &mut BTreeMap<String, &'a Value>) {
    match value {
        // Empty objects are leaves so that `{}` -> `{"a": 1}` is still visible.
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                flatten_into(format!("{}.{}", path, key), child, leaves);
            }
        }
        _ => {
            leaves.insert(path, value);
        }
    }
}
