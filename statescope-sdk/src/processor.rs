//! Canonical component index.
//!
//! The processor owns every component record reported by Observers, keyed by
//! id. Relationships are stored as id lists on the records themselves; tree
//! views are rebuilt from those links whenever they are asked for. All
//! mutating operations take the store lock and hold it across the storage
//! write, so two writers never interleave. The in-memory index only changes
//! once that write has succeeded.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use statescope_types::{
    current_timestamp_ms, Component, ComponentId, PropertyChange, UpdatePayload,
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::diff::property_changes;
use crate::storage::Storage;
use crate::{Error, Result};

/// Storage key of the component index.
pub const COMPONENTS_KEY: &str = "components";

/// Raw render samples kept per component; older samples are dropped.
pub const MAX_RENDER_SAMPLES: usize = 1000;

/// Size of the recent-samples window reported in [`RenderMetrics`].
pub const RECENT_RENDER_WINDOW: usize = 10;

/// A component with its resolved children, as returned by
/// [`ComponentProcessor::build_component_hierarchy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentNode {
    pub component: Component,
    pub children: Vec<ComponentNode>,
}

impl ComponentNode {
    /// Number of components in this subtree, including the root.
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(ComponentNode::size).sum::<usize>()
    }
}

/// Aggregated render timings for one component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderMetrics {
    pub count: usize,
    pub average_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    /// Last few samples, oldest first.
    pub recent: Vec<f64>,
}

/// A render that exceeded the slow-render threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlowRender {
    pub component_id: ComponentId,
    pub component_name: String,
    pub duration_ms: f64,
    pub timestamp: u64,
}

#[derive(Debug, Clone)]
struct RenderSample {
    duration_ms: f64,
    timestamp: u64,
    component_name: String,
}

#[derive(Debug)]
struct ProcessorState {
    components: BTreeMap<ComponentId, Component>,
    change_log: HashMap<ComponentId, Vec<PropertyChange>>,
    renders: HashMap<ComponentId, VecDeque<RenderSample>>,
    slow_render_threshold_ms: f64,
}

/// Canonical store of observed components.
#[derive(Debug)]
pub struct ComponentProcessor {
    state: Mutex<ProcessorState>,
    storage: Arc<dyn Storage>,
}

impl ComponentProcessor {
    /// Create an empty processor persisting into `storage`.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            state: Mutex::new(ProcessorState {
                components: BTreeMap::new(),
                change_log: HashMap::new(),
                renders: HashMap::new(),
                slow_render_threshold_ms: 16.0,
            }),
            storage,
        }
    }

    /// Reload the component index from storage, replacing what is in memory.
    ///
    /// Returns the number of components loaded.
    pub async fn load(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        let Some(doc) = self.storage.get(COMPONENTS_KEY).await? else {
            return Ok(0);
        };
        let components: Vec<Component> = serde_json::from_value(doc)?;
        state.components = components
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();
        Ok(state.components.len())
    }

    // ========================================================================
    // Index
    // ========================================================================

    /// Insert a new component or merge it into the stored record.
    ///
    /// On merge the earliest known mount time wins and the property diff is
    /// appended to the component's change log. A reported render time is
    /// recorded as a render sample. Returns the stored record once it has
    /// been persisted.
    pub async fn process_component(&self, mut record: Component) -> Result<Component> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let mut changes = Vec::new();
        if let Some(existing) = state.components.get(&record.id) {
            record.mount_time = earliest_mount(existing.mount_time, record.mount_time);
            changes = property_changes(&existing.state(), &record.state());
        } else if record.mount_time == 0 {
            record.mount_time = current_timestamp_ms();
        }

        let mut components = state.components.clone();
        components.insert(record.id.clone(), record.clone());
        self.persist(&components).await?;
        state.components = components;

        if !changes.is_empty() {
            debug!(component = %record.id, changes = changes.len(), "Component properties changed");
            state
                .change_log
                .entry(record.id.clone())
                .or_default()
                .extend(changes);
        }
        if let Some(ms) = record.render_time {
            push_render_sample(state, &record.id, &record.name, ms);
        }
        Ok(record)
    }

    /// All components, ordered by id.
    pub async fn get_components(&self) -> Vec<Component> {
        self.state.lock().await.components.values().cloned().collect()
    }

    pub async fn get_component(&self, id: &str) -> Option<Component> {
        self.state.lock().await.components.get(id).cloned()
    }

    pub async fn component_count(&self) -> usize {
        self.state.lock().await.components.len()
    }

    /// Remove exactly one component. Descendants are left in place.
    pub async fn remove_component(&self, id: &str) -> Result<Option<Component>> {
        let mut state = self.state.lock().await;
        if !state.components.contains_key(id) {
            return Ok(None);
        }

        let mut components = state.components.clone();
        let removed = components.remove(id);
        self.persist(&components).await?;
        state.components = components;
        state.change_log.remove(id);
        state.renders.remove(id);
        Ok(removed)
    }

    /// Drop every component together with change logs and render samples.
    pub async fn clear_components(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.persist(&BTreeMap::new()).await?;
        state.components.clear();
        state.change_log.clear();
        state.renders.clear();
        Ok(())
    }

    /// Case-insensitive substring search over component names.
    pub async fn find_components_by_name(&self, query: &str) -> Vec<Component> {
        let needle = query.to_lowercase();
        self.state
            .lock()
            .await
            .components
            .values()
            .filter(|c| c.name.to_lowercase().contains(&needle))
            .cloned()
            .collect()
    }

    // ========================================================================
    // Hierarchy
    // ========================================================================

    /// Rebuild the component forest from the id links.
    ///
    /// Roots are components with no known ancestor. Each component appears
    /// at most once; a link that would revisit a component is cut, and
    /// components only reachable through a cycle become roots themselves.
    pub async fn build_component_hierarchy(&self) -> Vec<ComponentNode> {
        let state = self.state.lock().await;
        let components = &state.components;
        let children = child_index(components);

        let mut visited = HashSet::new();
        let mut forest = Vec::new();

        let roots = components.values().filter(|c| {
            !c.ancestor_ids
                .iter()
                .any(|parent| components.contains_key(parent))
        });
        for root in roots {
            if let Some(node) = build_node(&root.id, components, &children, &mut visited) {
                forest.push(node);
            }
        }

        // Whatever is left hangs off a cycle.
        for id in components.keys() {
            if !visited.contains(id.as_str()) {
                if let Some(node) = build_node(id, components, &children, &mut visited) {
                    forest.push(node);
                }
            }
        }

        forest
    }

    /// Every transitive ancestor, nearest first. Empty for unknown ids.
    pub async fn get_component_ancestors(&self, id: &str) -> Vec<Component> {
        let state = self.state.lock().await;
        let components = &state.components;
        traverse(id, components, |c| c.ancestor_ids.clone())
    }

    /// Every transitive descendant, breadth-first. Empty for unknown ids.
    pub async fn get_component_descendants(&self, id: &str) -> Vec<Component> {
        let state = self.state.lock().await;
        let components = &state.components;
        let children = child_index(components);
        traverse(id, components, |c| {
            children.get(c.id.as_str()).cloned().unwrap_or_default()
        })
    }

    // ========================================================================
    // Change tracking
    // ========================================================================

    /// Diff two versions of a component and append the result to the change
    /// log of `next`. Returns only the changed leaf paths.
    pub async fn track_property_changes(
        &self,
        prev: &Component,
        next: &Component,
    ) -> Vec<PropertyChange> {
        let changes = property_changes(&prev.state(), &next.state());
        if !changes.is_empty() {
            self.state
                .lock()
                .await
                .change_log
                .entry(next.id.clone())
                .or_default()
                .extend(changes.iter().cloned());
        }
        changes
    }

    /// Change log of a component, oldest first.
    pub async fn property_changes(&self, id: &str) -> Vec<PropertyChange> {
        self.state
            .lock()
            .await
            .change_log
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn clear_property_changes(&self, id: &str) {
        self.state.lock().await.change_log.remove(id);
    }

    // ========================================================================
    // Edits
    // ========================================================================

    /// Check whether `value` may be written to `property` of component `id`.
    ///
    /// Returns the value to send on success.
    pub async fn validate_property_edit(
        &self,
        id: &str,
        property: &str,
        value: &Value,
    ) -> Result<Value> {
        let state = self.state.lock().await;
        let component = state
            .components
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("component {}", id)))?;
        let prop = component
            .properties
            .get(property)
            .ok_or_else(|| Error::NotFound(format!("property {} on {}", property, id)))?;

        if prop.computed {
            return Err(Error::Forbidden(format!("{} is computed", property)));
        }
        if !prop.is_editable() {
            return Err(Error::Forbidden(format!("{} is not public", property)));
        }
        if !prop.kind.accepts(value) {
            return Err(Error::Invalid(format!(
                "{} expects {}, got {}",
                property,
                prop.kind.as_str(),
                statescope_types::PropertyType::of(value).as_str()
            )));
        }

        Ok(value.clone())
    }

    /// Build the command payload for a single property edit, carrying the
    /// stored fingerprint of the component.
    pub async fn prepare_property_update_payload(
        &self,
        id: &str,
        property: &str,
        value: Value,
    ) -> Result<UpdatePayload> {
        let state = self.state.lock().await;
        let component = state
            .components
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("component {}", id)))?;
        Ok(UpdatePayload {
            component_id: component.id.clone(),
            fingerprint: component.fingerprint.clone(),
            property: property.to_string(),
            value,
        })
    }

    /// Build one payload per property, all carrying the same fingerprint.
    pub async fn prepare_batch_update_payload(
        &self,
        id: &str,
        values: &BTreeMap<String, Value>,
    ) -> Result<Vec<UpdatePayload>> {
        let state = self.state.lock().await;
        let component = state
            .components
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("component {}", id)))?;
        Ok(values
            .iter()
            .map(|(property, value)| UpdatePayload {
                component_id: component.id.clone(),
                fingerprint: component.fingerprint.clone(),
                property: property.clone(),
                value: value.clone(),
            })
            .collect())
    }

    // ========================================================================
    // Render performance
    // ========================================================================

    /// Record one render duration for a component.
    pub async fn record_render_time(&self, id: &str, duration_ms: f64) {
        let mut state = self.state.lock().await;
        let name = state
            .components
            .get(id)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| id.to_string());
        push_render_sample(&mut state, id, &name, duration_ms);
    }

    pub async fn render_metrics(&self, id: &str) -> Option<RenderMetrics> {
        let state = self.state.lock().await;
        let samples = state.renders.get(id)?;
        if samples.is_empty() {
            return None;
        }

        let durations: Vec<f64> = samples.iter().map(|s| s.duration_ms).collect();
        let count = durations.len();
        let sum: f64 = durations.iter().sum();
        let min = durations.iter().copied().fold(f64::INFINITY, f64::min);
        let max = durations.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let recent = durations[count.saturating_sub(RECENT_RENDER_WINDOW)..].to_vec();

        Some(RenderMetrics {
            count,
            average_ms: sum / count as f64,
            min_ms: min,
            max_ms: max,
            recent,
        })
    }

    pub async fn set_slow_render_threshold(&self, threshold_ms: f64) {
        self.state.lock().await.slow_render_threshold_ms = threshold_ms;
    }

    pub async fn slow_render_threshold(&self) -> f64 {
        self.state.lock().await.slow_render_threshold_ms
    }

    /// Every retained sample above the threshold, oldest first.
    pub async fn slow_renders(&self) -> Vec<SlowRender> {
        let state = self.state.lock().await;
        let threshold = state.slow_render_threshold_ms;
        let mut slow: Vec<SlowRender> = state
            .renders
            .iter()
            .flat_map(|(id, samples)| {
                samples
                    .iter()
                    .filter(move |s| s.duration_ms > threshold)
                    .map(move |s| SlowRender {
                        component_id: id.clone(),
                        component_name: s.component_name.clone(),
                        duration_ms: s.duration_ms,
                        timestamp: s.timestamp,
                    })
            })
            .collect();
        slow.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.component_id.cmp(&b.component_id))
        });
        slow
    }

    async fn persist(&self, components: &BTreeMap<ComponentId, Component>) -> Result<()> {
        let components: Vec<&Component> = components.values().collect();
        let doc = serde_json::to_value(components)?;
        if let Err(e) = self.storage.put(COMPONENTS_KEY, doc).await {
            warn!(error = %e, "Failed to persist component index");
            return Err(e);
        }
        Ok(())
    }
}

fn earliest_mount(existing: u64, incoming: u64) -> u64 {
    match (existing, incoming) {
        (0, t) | (t, 0) => t,
        (a, b) => a.min(b),
    }
}

fn push_render_sample(state: &mut ProcessorState, id: &str, name: &str, duration_ms: f64) {
    let samples = state.renders.entry(id.to_string()).or_default();
    if samples.len() >= MAX_RENDER_SAMPLES {
        samples.pop_front();
    }
    samples.push_back(RenderSample {
        duration_ms,
        timestamp: current_timestamp_ms(),
        component_name: name.to_string(),
    });
}

/// Children of every component: declared `children_ids` plus components that
/// name it as an ancestor. Only ids present in the index are kept.
fn child_index(components: &BTreeMap<ComponentId, Component>) -> HashMap<&str, Vec<ComponentId>> {
    let mut index: HashMap<&str, Vec<ComponentId>> = HashMap::new();

    for component in components.values() {
        for child in &component.children_ids {
            if components.contains_key(child) {
                push_unique(index.entry(component.id.as_str()).or_default(), child);
            }
        }
        for parent in &component.ancestor_ids {
            if let Some((parent_id, _)) = components.get_key_value(parent) {
                push_unique(index.entry(parent_id.as_str()).or_default(), &component.id);
            }
        }
    }

    index
}

fn push_unique(list: &mut Vec<ComponentId>, id: &ComponentId) {
    if !list.contains(id) {
        list.push(id.clone());
    }
}

fn build_node<'a>(
    id: &'a str,
    components: &'a BTreeMap<ComponentId, Component>,
    children: &HashMap<&str, Vec<ComponentId>>,
    visited: &mut HashSet<&'a str>,
) -> Option<ComponentNode> {
    let (key, component) = components.get_key_value(id)?;
    if !visited.insert(key.as_str()) {
        return None;
    }

    let child_nodes = children
        .get(key.as_str())
        .map(|ids| {
            ids.iter()
                .filter_map(|child| {
                    let (child_key, _) = components.get_key_value(child)?;
                    build_node(child_key.as_str(), components, children, visited)
                })
                .collect()
        })
        .unwrap_or_default();

    Some(ComponentNode {
        component: component.clone(),
        children: child_nodes,
    })
}

/// Breadth-first walk from `start` following `next`, excluding `start`.
fn traverse<F>(start: &str, components: &BTreeMap<ComponentId, Component>, next: F) -> Vec<Component>
where
    F: Fn(&Component) -> Vec<ComponentId>,
{
    let Some(origin) = components.get(start) else {
        return Vec::new();
    };

    let mut seen: HashSet<ComponentId> = HashSet::from([origin.id.clone()]);
    let mut queue: VecDeque<&Component> = VecDeque::from([origin]);
    let mut out = Vec::new();

    while let Some(current) = queue.pop_front() {
        for id in next(current) {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(found) = components.get(&id) {
                out.push(found.clone());
                queue.push_back(found);
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FailingStorage, MemoryStorage};
    use serde_json::json;
    use statescope_types::Visibility;

    fn processor() -> ComponentProcessor {
        ComponentProcessor::new(Arc::new(MemoryStorage::new()))
    }

    fn counter(count: i64) -> Component {
        Component::builder("comp-1", "Counter")
            .fingerprint("fp-1")
            .property("count", json!(count))
            .property("title", json!("My Counter"))
            .build()
    }

    #[tokio::test]
    async fn counter_update_records_single_change() {
        let processor = processor();
        processor.process_component(counter(0)).await.unwrap();
        processor.process_component(counter(5)).await.unwrap();

        assert_eq!(
            processor.property_changes("comp-1").await,
            vec![PropertyChange {
                property: "count".to_string(),
                from: Some(json!(0)),
                to: Some(json!(5)),
            }]
        );

        processor.clear_property_changes("comp-1").await;
        assert!(processor.property_changes("comp-1").await.is_empty());
    }

    #[tokio::test]
    async fn track_property_changes_omits_unchanged_leaves() {
        let processor = processor();
        let changes = processor
            .track_property_changes(&counter(0), &counter(5))
            .await;
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].property, "count");

        let none = processor
            .track_property_changes(&counter(5), &counter(5))
            .await;
        assert!(none.is_empty());
        assert_eq!(processor.property_changes("comp-1").await.len(), 1);
    }

    #[tokio::test]
    async fn merge_keeps_earliest_mount_time() {
        let processor = processor();
        let early = Component::builder("a", "A").mount_time(100).build();
        let late = Component::builder("a", "A").mount_time(500).build();

        processor.process_component(early).await.unwrap();
        let merged = processor.process_component(late).await.unwrap();
        assert_eq!(merged.mount_time, 100);
    }

    #[tokio::test]
    async fn process_component_persists_before_returning() {
        let storage = Arc::new(MemoryStorage::new());
        let processor = ComponentProcessor::new(storage.clone());
        processor.process_component(counter(1)).await.unwrap();

        let doc = storage.get(COMPONENTS_KEY).await.unwrap().unwrap();
        assert_eq!(doc[0]["id"], "comp-1");

        let reloaded = ComponentProcessor::new(storage);
        assert_eq!(reloaded.load().await.unwrap(), 1);
        assert!(reloaded.get_component("comp-1").await.is_some());
    }

    #[tokio::test]
    async fn remove_component_does_not_cascade() {
        let processor = processor();
        processor
            .process_component(Component::builder("root", "App").child("leaf").build())
            .await
            .unwrap();
        processor
            .process_component(Component::builder("leaf", "Leaf").ancestor("root").build())
            .await
            .unwrap();

        let removed = processor.remove_component("root").await.unwrap();
        assert_eq!(removed.map(|c| c.id), Some("root".to_string()));
        assert!(processor.get_component("leaf").await.is_some());
        assert!(processor.remove_component("root").await.unwrap().is_none());

        processor.clear_components().await.unwrap();
        assert_eq!(processor.component_count().await, 0);
    }

    async fn tree() -> ComponentProcessor {
        let processor = processor();
        for component in [
            Component::builder("app", "App").child("nav").child("main").build(),
            Component::builder("nav", "NavBar").ancestor("app").build(),
            Component::builder("main", "MainPanel").ancestor("app").build(),
            Component::builder("list", "UserList").ancestor("main").build(),
            Component::builder("item", "UserListItem").ancestor("list").build(),
        ] {
            processor.process_component(component).await.unwrap();
        }
        processor
    }

    #[tokio::test]
    async fn hierarchy_is_rebuilt_from_links() {
        let processor = tree().await;
        let forest = processor.build_component_hierarchy().await;

        assert_eq!(forest.len(), 1);
        assert_eq!(forest[0].component.id, "app");
        assert_eq!(forest[0].size(), 5);

        processor.remove_component("main").await.unwrap();
        let forest = processor.build_component_hierarchy().await;
        let roots: Vec<&str> = forest.iter().map(|n| n.component.id.as_str()).collect();
        assert_eq!(roots, vec!["app", "list"]);
    }

    #[tokio::test]
    async fn hierarchy_cuts_cycles() {
        let processor = processor();
        processor
            .process_component(Component::builder("a", "A").ancestor("b").build())
            .await
            .unwrap();
        processor
            .process_component(Component::builder("b", "B").ancestor("a").build())
            .await
            .unwrap();

        let forest = processor.build_component_hierarchy().await;
        let total: usize = forest.iter().map(ComponentNode::size).sum();
        assert_eq!(total, 2);
    }

    #[tokio::test]
    async fn ancestors_and_descendants_are_transitive() {
        let processor = tree().await;

        let ancestors: Vec<String> = processor
            .get_component_ancestors("item")
            .await
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ancestors, vec!["list", "main", "app"]);

        let descendants: Vec<String> = processor
            .get_component_descendants("main")
            .await
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(descendants, vec!["list", "item"]);

        assert!(processor.get_component_ancestors("app").await.is_empty());
        assert!(processor.get_component_descendants("item").await.is_empty());
        assert!(processor.get_component_ancestors("ghost").await.is_empty());
    }

    #[tokio::test]
    async fn find_by_name_is_case_insensitive() {
        let processor = tree().await;
        let mut found: Vec<String> = processor
            .find_components_by_name("userlist")
            .await
            .into_iter()
            .map(|c| c.id)
            .collect();
        found.sort();
        assert_eq!(found, vec!["item", "list"]);
    }

    #[tokio::test]
    async fn validate_edit_succeeds_iff_present_public_and_not_computed() {
        let processor = processor();
        processor
            .process_component(
                Component::builder("c", "Form")
                    .property("name", json!("ada"))
                    .property("anything", json!(null))
                    .property_with("total", json!(3), |p| p.computed(true))
                    .property_with("secret", json!("x"), |p| p.visibility(Visibility::Protected))
                    .build(),
            )
            .await
            .unwrap();

        assert_eq!(
            processor
                .validate_property_edit("c", "name", &json!("grace"))
                .await
                .unwrap(),
            json!("grace")
        );
        assert!(processor
            .validate_property_edit("c", "anything", &json!([1, 2]))
            .await
            .is_ok());

        let reason = |r: Result<Value>| r.unwrap_err().reason();
        use statescope_types::Reason;
        assert_eq!(
            reason(processor.validate_property_edit("c", "missing", &json!(1)).await),
            Reason::NotFound
        );
        assert_eq!(
            reason(processor.validate_property_edit("nope", "name", &json!(1)).await),
            Reason::NotFound
        );
        assert_eq!(
            reason(processor.validate_property_edit("c", "total", &json!(4)).await),
            Reason::Forbidden
        );
        assert_eq!(
            reason(processor.validate_property_edit("c", "secret", &json!("y")).await),
            Reason::Forbidden
        );
        assert_eq!(
            reason(processor.validate_property_edit("c", "name", &json!(42)).await),
            Reason::Invalid
        );
    }

    #[tokio::test]
    async fn payloads_embed_stored_fingerprint() {
        let processor = processor();
        processor.process_component(counter(0)).await.unwrap();

        let payload = processor
            .prepare_property_update_payload("comp-1", "count", json!(7))
            .await
            .unwrap();
        assert_eq!(payload.fingerprint, "fp-1");
        assert_eq!(payload.value, json!(7));

        let batch = processor
            .prepare_batch_update_payload(
                "comp-1",
                &BTreeMap::from([
                    ("count".to_string(), json!(1)),
                    ("title".to_string(), json!("t")),
                ]),
            )
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch.iter().all(|p| p.fingerprint == "fp-1"));

        assert!(processor
            .prepare_property_update_payload("ghost", "count", json!(1))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn render_metrics_and_slow_renders() {
        let processor = processor();
        processor.process_component(counter(0)).await.unwrap();

        for ms in [4.0, 8.0, 30.0, 2.0] {
            processor.record_render_time("comp-1", ms).await;
        }

        let metrics = processor.render_metrics("comp-1").await.unwrap();
        assert_eq!(metrics.count, 4);
        assert_eq!(metrics.min_ms, 2.0);
        assert_eq!(metrics.max_ms, 30.0);
        assert_eq!(metrics.average_ms, 11.0);
        assert_eq!(metrics.recent, vec![4.0, 8.0, 30.0, 2.0]);

        let slow = processor.slow_renders().await;
        assert_eq!(slow.len(), 1);
        assert_eq!(slow[0].component_name, "Counter");
        assert_eq!(slow[0].duration_ms, 30.0);

        processor.set_slow_render_threshold(5.0).await;
        assert_eq!(processor.slow_renders().await.len(), 2);
        assert!(processor.render_metrics("ghost").await.is_none());
    }

    #[tokio::test]
    async fn render_samples_are_capped() {
        let processor = processor();
        for i in 0..(MAX_RENDER_SAMPLES + 5) {
            processor.record_render_time("c", i as f64).await;
        }

        let metrics = processor.render_metrics("c").await.unwrap();
        assert_eq!(metrics.count, MAX_RENDER_SAMPLES);
        assert_eq!(metrics.min_ms, 5.0);
        assert_eq!(metrics.recent.len(), RECENT_RENDER_WINDOW);
    }

    #[tokio::test]
    async fn failed_write_keeps_the_previous_index() {
        let storage = Arc::new(FailingStorage::default());
        let processor = ComponentProcessor::new(storage.clone());
        processor.process_component(counter(0)).await.unwrap();

        storage.set_failing(true);
        assert!(processor.process_component(counter(5)).await.is_err());
        let stored = processor.get_component("comp-1").await.unwrap();
        assert_eq!(stored.properties["count"].value, json!(0));
        assert!(processor.property_changes("comp-1").await.is_empty());

        assert!(processor.remove_component("comp-1").await.is_err());
        assert!(processor.clear_components().await.is_err());
        assert_eq!(processor.component_count().await, 1);

        storage.set_failing(false);
        processor.remove_component("comp-1").await.unwrap();
        assert_eq!(processor.component_count().await, 0);
    }
}
