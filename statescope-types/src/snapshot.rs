//! Snapshots - captured component state for time-travel.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ComponentId, SchemaVersion};

/// Identifier of a snapshot.
pub type SnapshotId = String;

/// A point-in-time copy of one component's property values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub id: SnapshotId,
    pub component_id: ComponentId,
    pub name: String,

    /// Unix timestamp in milliseconds when the snapshot was taken.
    pub timestamp: u64,

    /// Property values at capture time.
    pub state: BTreeMap<String, Value>,

    /// Whether the snapshot came from the periodic auto-capture task.
    #[serde(default)]
    pub is_auto_snapshot: bool,
}

/// Reference to the component an export bundle belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentRef {
    pub id: ComponentId,
    pub name: String,
}

/// Portable export of one component's snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotBundle {
    pub version: SchemaVersion,
    pub component: ComponentRef,
    pub snapshots: Vec<Snapshot>,
    pub exported_at: u64,
}

/// Before/after values of one leaf path. `None` means the path is absent
/// on that side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueChange {
    pub before: Option<Value>,
    pub after: Option<Value>,
}

/// Diff keyed by dot-qualified leaf path (e.g. `user.settings.theme`).
pub type StateDiff = BTreeMap<String, ValueChange>;

/// One changed leaf, as recorded in a component's change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyChange {
    pub property: String,
    pub from: Option<Value>,
    pub to: Option<Value>,
}
