//! Bounded snapshot store for time-travel.
//!
//! Snapshots are value copies of a component's property values. The store is
//! capped by a [`CapacityPolicy`]; when an insert overflows the cap exactly
//! one snapshot is evicted, the one with the earliest timestamp in scope
//! (ties go to the one inserted first).
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use serde_json::json;
//! use statescope_sdk::{CapacityPolicy, MemoryStorage, SnapshotManager};
//! use statescope_types::Component;
//!
//! # tokio_test::block_on(async {
//! let manager = SnapshotManager::new(Arc::new(MemoryStorage::new()), CapacityPolicy::Global { max: 10 });
//! let counter = Component::builder("comp-1", "Counter").property("count", json!(0)).build();
//!
//! let before = manager.create_snapshot(&counter, Some("before")).await.unwrap();
//! let diff = manager
//!     .compare_with_current_state(&before.id, &[("count".to_string(), json!(3))].into())
//!     .await
//!     .unwrap();
//! assert_eq!(diff["count"].after, Some(json!(3)));
//! # });
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use statescope_types::{
    current_timestamp_ms, Component, ComponentId, ComponentRef, SchemaVersion, Snapshot,
    SnapshotBundle, SnapshotId, StateDiff,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::diff::diff_states;
use crate::settings::SnapshotSettings;
use crate::storage::Storage;
use crate::task::TaskHandle;
use crate::{Error, Result};

/// Storage key of the snapshot store.
pub const SNAPSHOTS_KEY: &str = "snapshots";

/// How the snapshot cap is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "kebab-case")]
pub enum CapacityPolicy {
    /// One pool for the whole store; overflow evicts the oldest snapshot of any component.
    Global { max: usize },
    /// Each component has its own pool; overflow evicts that component's oldest snapshot.
    PerComponent { max: usize },
}

impl CapacityPolicy {
    pub fn max(&self) -> usize {
        match self {
            CapacityPolicy::Global { max } | CapacityPolicy::PerComponent { max } => *max,
        }
    }
}

impl Default for CapacityPolicy {
    fn default() -> Self {
        CapacityPolicy::Global { max: 50 }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    snapshots: Vec<Snapshot>,
    #[serde(default)]
    components: BTreeMap<ComponentId, String>,
}

#[derive(Debug, Clone)]
struct StoreState {
    /// Insertion order.
    snapshots: Vec<Snapshot>,
    /// Names of components that have been snapshotted, for export.
    component_names: HashMap<ComponentId, String>,
}

struct ManagerInner {
    state: Mutex<StoreState>,
    storage: Arc<dyn Storage>,
    settings: SyncMutex<SnapshotSettings>,
    auto_task: SyncMutex<Option<TaskHandle>>,
    auto_counter: AtomicU64,
}

/// Snapshot store with capture, comparison, auto-capture and import/export.
///
/// Cloning is cheap and every clone shares the same store.
#[derive(Clone)]
pub struct SnapshotManager {
    inner: Arc<ManagerInner>,
}

impl SnapshotManager {
    /// Create a store with the given policy and auto-capture disabled.
    pub fn new(storage: Arc<dyn Storage>, policy: CapacityPolicy) -> Self {
        Self::with_settings(storage, SnapshotSettings::default().with_policy(policy))
    }

    /// Create a store configured from settings.
    pub fn with_settings(storage: Arc<dyn Storage>, settings: SnapshotSettings) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                state: Mutex::new(StoreState {
                    snapshots: Vec::new(),
                    component_names: HashMap::new(),
                }),
                storage,
                settings: SyncMutex::new(settings),
                auto_task: SyncMutex::new(None),
                auto_counter: AtomicU64::new(0),
            }),
        }
    }

    /// Reload the store from storage, replacing what is in memory.
    pub async fn load(&self) -> Result<usize> {
        let mut state = self.inner.state.lock().await;
        let Some(doc) = self.inner.storage.get(SNAPSHOTS_KEY).await? else {
            return Ok(0);
        };
        let doc: StoreDocument = serde_json::from_value(doc)?;
        state.snapshots = doc.snapshots;
        state.component_names = doc.components.into_iter().collect();
        Ok(state.snapshots.len())
    }

    pub fn policy(&self) -> CapacityPolicy {
        self.inner.settings.lock().policy()
    }

    pub fn settings(&self) -> SnapshotSettings {
        self.inner.settings.lock().clone()
    }

    /// Replace the settings.
    ///
    /// The capacity policy applies from the next insert. Auto-capture
    /// settings apply on the next [`start_auto_snapshots`](Self::start_auto_snapshots);
    /// a running task keeps its interval.
    pub fn update_settings(&self, settings: SnapshotSettings) {
        *self.inner.settings.lock() = settings;
    }

    // ========================================================================
    // Capture
    // ========================================================================

    /// Capture the component's current property values.
    ///
    /// Without a label the snapshot is named after its capture time.
    pub async fn create_snapshot(&self, component: &Component, label: Option<&str>) -> Result<Snapshot> {
        let timestamp = current_timestamp_ms();
        let name = match label {
            Some(label) if !label.trim().is_empty() => label.to_string(),
            _ => format!("Snapshot @{}", timestamp),
        };
        self.insert(component, name, timestamp, false).await
    }

    /// Capture flagged as automatic, with a generated label.
    pub async fn create_auto_snapshot(&self, component: &Component) -> Result<Snapshot> {
        let n = self.inner.auto_counter.fetch_add(1, Ordering::Relaxed) + 1;
        self.insert(component, format!("Auto snapshot #{}", n), current_timestamp_ms(), true)
            .await
    }

    async fn insert(
        &self,
        component: &Component,
        name: String,
        timestamp: u64,
        is_auto_snapshot: bool,
    ) -> Result<Snapshot> {
        let snapshot = Snapshot {
            id: new_snapshot_id(),
            component_id: component.id.clone(),
            name,
            timestamp,
            state: component.state(),
            is_auto_snapshot,
        };

        let policy = self.policy();
        let mut state = self.inner.state.lock().await;
        let mut next = state.clone();
        next.component_names
            .insert(component.id.clone(), component.name.clone());
        push_bounded(&mut next.snapshots, snapshot.clone(), policy);
        self.commit(&mut state, next).await?;

        debug!(snapshot = %snapshot.id, component = %snapshot.component_id, auto = is_auto_snapshot, "Snapshot created");
        Ok(snapshot)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn get_snapshot(&self, id: &str) -> Option<Snapshot> {
        let state = self.inner.state.lock().await;
        state.snapshots.iter().find(|s| s.id == id).cloned()
    }

    /// Snapshots of one component, ordered by timestamp.
    pub async fn get_component_snapshots(&self, component_id: &str) -> Vec<Snapshot> {
        let state = self.inner.state.lock().await;
        let mut snapshots: Vec<Snapshot> = state
            .snapshots
            .iter()
            .filter(|s| s.component_id == component_id)
            .cloned()
            .collect();
        snapshots.sort_by_key(|s| s.timestamp);
        snapshots
    }

    /// Every snapshot in the store, in insertion order.
    pub async fn all_snapshots(&self) -> Vec<Snapshot> {
        self.inner.state.lock().await.snapshots.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.snapshots.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Fetch the snapshot to restore. The caller turns its state into a batch
    /// update addressed to the owning Observer.
    pub async fn restore_snapshot(&self, id: &str) -> Result<Snapshot> {
        self.get_snapshot(id)
            .await
            .ok_or_else(|| Error::NotFound(format!("snapshot {}", id)))
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    pub async fn delete_snapshot(&self, id: &str) -> Result<Snapshot> {
        let mut state = self.inner.state.lock().await;
        let index = state
            .snapshots
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| Error::NotFound(format!("snapshot {}", id)))?;
        let mut next = state.clone();
        let removed = next.snapshots.remove(index);
        self.commit(&mut state, next).await?;
        Ok(removed)
    }

    /// Delete every snapshot of a component. Returns how many were removed.
    pub async fn delete_component_snapshots(&self, component_id: &str) -> Result<usize> {
        self.delete_where(|s| s.component_id == component_id).await
    }

    /// Delete a component's automatic snapshots, keeping manual ones.
    pub async fn delete_auto_snapshots(&self, component_id: &str) -> Result<usize> {
        self.delete_where(|s| s.component_id == component_id && s.is_auto_snapshot)
            .await
    }

    /// Drop every snapshot.
    pub async fn clear(&self) -> Result<()> {
        self.delete_where(|_| true).await.map(|_| ())
    }

    async fn delete_where<F>(&self, predicate: F) -> Result<usize>
    where
        F: Fn(&Snapshot) -> bool,
    {
        let mut state = self.inner.state.lock().await;
        let mut next = state.clone();
        next.snapshots.retain(|s| !predicate(s));
        let removed = state.snapshots.len() - next.snapshots.len();
        if removed > 0 {
            self.commit(&mut state, next).await?;
        }
        Ok(removed)
    }

    pub async fn rename_snapshot(&self, id: &str, name: &str) -> Result<Snapshot> {
        let mut state = self.inner.state.lock().await;
        let mut next = state.clone();
        let snapshot = next
            .snapshots
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| Error::NotFound(format!("snapshot {}", id)))?;
        snapshot.name = name.to_string();
        let renamed = snapshot.clone();
        self.commit(&mut state, next).await?;
        Ok(renamed)
    }

    // ========================================================================
    // Comparison
    // ========================================================================

    /// Path-qualified diff from snapshot `a` to snapshot `b`.
    pub async fn compare_snapshots(&self, a: &str, b: &str) -> Result<StateDiff> {
        let state = self.inner.state.lock().await;
        let find = |id: &str| {
            state
                .snapshots
                .iter()
                .find(|s| s.id == id)
                .ok_or_else(|| Error::NotFound(format!("snapshot {}", id)))
        };
        let (first, second) = (find(a)?, find(b)?);
        Ok(diff_states(&first.state, &second.state))
    }

    /// Path-qualified diff from a snapshot to the given live state.
    pub async fn compare_with_current_state(
        &self,
        id: &str,
        current: &BTreeMap<String, Value>,
    ) -> Result<StateDiff> {
        let snapshot = self.restore_snapshot(id).await?;
        Ok(diff_states(&snapshot.state, current))
    }

    // ========================================================================
    // Auto-capture
    // ========================================================================

    /// Arm periodic auto-capture if it is enabled in the settings.
    ///
    /// `source` is called on every tick and returns the components to
    /// capture. An already running task is replaced. Returns whether a task
    /// was started.
    pub fn start_auto_snapshots<F>(&self, source: F) -> bool
    where
        F: Fn() -> Vec<Component> + Send + Sync + 'static,
    {
        self.stop_auto_snapshots();

        let settings = self.settings();
        if !settings.auto_enabled {
            debug!("Auto snapshots disabled, not starting");
            return false;
        }

        let manager = self.clone();
        let source = Arc::new(source);
        let handle = TaskHandle::spawn_periodic(settings.auto_interval(), move || {
            let manager = manager.clone();
            let source = source.clone();
            async move {
                for component in source() {
                    if let Err(e) = manager.create_auto_snapshot(&component).await {
                        warn!(component = %component.id, error = %e, "Auto snapshot failed");
                    }
                }
            }
        });

        info!(interval_ms = settings.auto_interval_ms, "Auto snapshots started");
        *self.inner.auto_task.lock() = Some(handle);
        true
    }

    /// Cancel the auto-capture task. No capture runs after this returns.
    pub fn stop_auto_snapshots(&self) {
        if let Some(handle) = self.inner.auto_task.lock().take() {
            handle.stop();
            info!("Auto snapshots stopped");
        }
    }

    pub fn is_auto_running(&self) -> bool {
        self.inner.auto_task.lock().is_some()
    }

    // ========================================================================
    // Import / export
    // ========================================================================

    /// Export every snapshot of a component as a portable bundle.
    pub async fn export_snapshots(&self, component_id: &str) -> Result<SnapshotBundle> {
        let state = self.inner.state.lock().await;
        let mut snapshots: Vec<Snapshot> = state
            .snapshots
            .iter()
            .filter(|s| s.component_id == component_id)
            .cloned()
            .collect();
        let name = match state.component_names.get(component_id) {
            Some(name) => name.clone(),
            None if !snapshots.is_empty() => component_id.to_string(),
            None => return Err(Error::NotFound(format!("component {}", component_id))),
        };
        snapshots.sort_by_key(|s| s.timestamp);

        Ok(SnapshotBundle {
            version: SchemaVersion::current(),
            component: ComponentRef {
                id: component_id.to_string(),
                name,
            },
            snapshots,
            exported_at: current_timestamp_ms(),
        })
    }

    /// Import a bundle produced by [`export_snapshots`](Self::export_snapshots).
    ///
    /// The whole bundle is validated before anything is written; a malformed
    /// bundle leaves the store untouched. Snapshot ids that already exist are
    /// replaced with fresh ones. Imported snapshots are subject to the
    /// capacity policy like any other insert.
    pub async fn import_snapshots(&self, bundle: &Value) -> Result<Vec<Snapshot>> {
        let bundle = validate_bundle(bundle)?;
        let policy = self.policy();

        let mut state = self.inner.state.lock().await;
        let mut next = state.clone();
        next.component_names
            .insert(bundle.component.id.clone(), bundle.component.name.clone());

        let mut imported = Vec::with_capacity(bundle.snapshots.len());
        for mut snapshot in bundle.snapshots {
            if next.snapshots.iter().any(|s| s.id == snapshot.id) {
                snapshot.id = new_snapshot_id();
            }
            push_bounded(&mut next.snapshots, snapshot.clone(), policy);
            imported.push(snapshot);
        }
        self.commit(&mut state, next).await?;

        info!(component = %bundle.component.id, count = imported.len(), "Snapshots imported");
        Ok(imported)
    }

    /// Persist `next` and only then make it the live state. A failed write
    /// leaves `state` as it was.
    async fn commit(&self, state: &mut StoreState, next: StoreState) -> Result<()> {
        self.persist(&next).await?;
        *state = next;
        Ok(())
    }

    async fn persist(&self, state: &StoreState) -> Result<()> {
        let doc = StoreDocument {
            snapshots: state.snapshots.clone(),
            components: state
                .component_names
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        self.inner
            .storage
            .put(SNAPSHOTS_KEY, serde_json::to_value(doc)?)
            .await
    }
}

impl std::fmt::Debug for SnapshotManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotManager")
            .field("policy", &self.policy())
            .field("auto_running", &self.is_auto_running())
            .finish()
    }
}

fn new_snapshot_id() -> SnapshotId {
    uuid::Uuid::new_v4().to_string()
}

/// Append and evict at most one snapshot if the policy's cap is exceeded.
fn push_bounded(snapshots: &mut Vec<Snapshot>, snapshot: Snapshot, policy: CapacityPolicy) {
    let component_id = snapshot.component_id.clone();
    snapshots.push(snapshot);

    let victim = match policy {
        CapacityPolicy::Global { max } if snapshots.len() > max => snapshots
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.timestamp)
            .map(|(i, _)| i),
        CapacityPolicy::PerComponent { max } => {
            let owned = snapshots
                .iter()
                .filter(|s| s.component_id == component_id)
                .count();
            if owned > max {
                snapshots
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.component_id == component_id)
                    .min_by_key(|(_, s)| s.timestamp)
                    .map(|(i, _)| i)
            } else {
                None
            }
        }
        _ => None,
    };

    if let Some(index) = victim {
        let evicted = snapshots.remove(index);
        debug!(snapshot = %evicted.id, component = %evicted.component_id, "Snapshot evicted");
    }
}

/// Single validation gate for imports.
fn validate_bundle(bundle: &Value) -> Result<SnapshotBundle> {
    let object = bundle
        .as_object()
        .ok_or_else(|| Error::Invalid("bundle must be an object".into()))?;
    for field in ["version", "component", "snapshots"] {
        if !object.contains_key(field) {
            return Err(Error::Invalid(format!("bundle is missing `{}`", field)));
        }
    }

    let bundle: SnapshotBundle = serde_json::from_value(bundle.clone())
        .map_err(|e| Error::Invalid(format!("malformed bundle: {}", e)))?;

    if !bundle.version.is_compatible() {
        return Err(Error::Invalid(format!(
            "unsupported bundle version {}",
            bundle.version
        )));
    }
    if bundle.component.id.is_empty() {
        return Err(Error::Invalid("bundle component has no id".into()));
    }
    if let Some(stray) = bundle
        .snapshots
        .iter()
        .find(|s| s.component_id != bundle.component.id)
    {
        return Err(Error::Invalid(format!(
            "snapshot {} belongs to {}, not {}",
            stray.id, stray.component_id, bundle.component.id
        )));
    }

    Ok(bundle)
}
