//! An in-memory [`Host`] for tests and demos.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::host::{
    Host, HostElement, HostFeature, HostSignal, Listener, ListenerId, ListenerKind, Mutation,
};
use crate::ObserverError;

/// Behavior attached to a method name: mutates the component data and
/// returns the call result.
pub type MethodHandler = Arc<dyn Fn(&mut Map<String, Value>, &[Value]) -> Value + Send + Sync>;

#[derive(Default)]
struct MemoryState {
    elements: Vec<HostElement>,
    features: HashSet<HostFeature>,
    listeners: BTreeMap<ListenerId, (ListenerKind, Listener)>,
    next_listener: ListenerId,
    detached: HashSet<String>,
    highlighted: Vec<String>,
    calls: Vec<(String, String, Vec<Value>)>,
    methods: HashMap<String, MethodHandler>,
}

/// Element tree held in memory.
///
/// Structural changes go through [`add_element`](Self::add_element) and
/// [`remove_element`](Self::remove_element) and are announced as mutations.
/// Property writes are announced through the lifecycle hook of whichever hook
/// API the host offers.
pub struct MemoryHost {
    state: Mutex<MemoryState>,
}

impl MemoryHost {
    /// A host with mutation watching and legacy lifecycle hooks.
    pub fn new() -> Self {
        Self::with_features(&[HostFeature::MutationWatch, HostFeature::LegacyHooks])
    }

    pub fn with_features(features: &[HostFeature]) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                features: features.iter().copied().collect(),
                next_listener: 1,
                ..MemoryState::default()
            }),
        }
    }

    /// Insert an element and announce it.
    pub fn add_element(&self, key: &str, parent: Option<&str>, metadata: Value) {
        self.add_raw_element(key, parent, &metadata.to_string());
    }

    /// Insert an element whose metadata is given verbatim (may be malformed).
    pub fn add_raw_element(&self, key: &str, parent: Option<&str>, metadata: &str) {
        let element = HostElement {
            key: key.to_string(),
            parent: parent.map(str::to_string),
            metadata: metadata.to_string(),
        };
        self.state.lock().elements.push(element.clone());
        self.notify(&ListenerKind::Mutations, HostSignal::Mutation(Mutation::Added(element)));
    }

    /// Remove an element with its whole subtree. Only the root is announced.
    pub fn remove_element(&self, key: &str) {
        {
            let mut state = self.state.lock();
            let mut doomed: HashSet<String> = HashSet::from([key.to_string()]);
            loop {
                let before = doomed.len();
                for el in &state.elements {
                    if el.parent.as_ref().is_some_and(|p| doomed.contains(p)) {
                        doomed.insert(el.key.clone());
                    }
                }
                if doomed.len() == before {
                    break;
                }
            }
            state.elements.retain(|el| !doomed.contains(&el.key));
        }
        self.notify(
            &ListenerKind::Mutations,
            HostSignal::Mutation(Mutation::Removed(key.to_string())),
        );
    }

    /// Drop the live component behind an element while leaving the element listed.
    pub fn detach(&self, key: &str) {
        self.state.lock().detached.insert(key.to_string());
    }

    /// Attach behavior to a method name, for every element declaring it.
    pub fn register_method<F>(&self, name: &str, handler: F)
    where
        F: Fn(&mut Map<String, Value>, &[Value]) -> Value + Send + Sync + 'static,
    {
        self.state
            .lock()
            .methods
            .insert(name.to_string(), Arc::new(handler));
    }

    /// Fire a lifecycle hook for an element.
    pub fn fire_hook(&self, hook: &str, key: &str) {
        self.notify(
            &ListenerKind::Hook(hook.to_string()),
            HostSignal::Lifecycle {
                hook: hook.to_string(),
                key: key.to_string(),
            },
        );
    }

    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }

    pub fn highlighted(&self) -> Vec<String> {
        self.state.lock().highlighted.clone()
    }

    /// Every method call, as `(key, method, args)`.
    pub fn calls(&self) -> Vec<(String, String, Vec<Value>)> {
        self.state.lock().calls.clone()
    }

    /// Current `data` object of an element.
    pub fn data(&self, key: &str) -> Option<Map<String, Value>> {
        let state = self.state.lock();
        let element = state.elements.iter().find(|el| el.key == key)?;
        let blob: Value = serde_json::from_str(&element.metadata).ok()?;
        blob.get("data").and_then(Value::as_object).cloned()
    }

    fn update_hook(&self) -> &'static str {
        if self.supports(HostFeature::CommitHooks) {
            "commit"
        } else {
            "updated"
        }
    }

    /// Rewrite an element's `data` object in place.
    fn edit_data<R>(
        &self,
        key: &str,
        edit: impl FnOnce(&mut Map<String, Value>) -> R,
    ) -> Result<R, ObserverError> {
        let mut state = self.state.lock();
        let element = state
            .elements
            .iter_mut()
            .find(|el| el.key == key)
            .ok_or_else(|| ObserverError::NotFound(format!("element {}", key)))?;

        let mut blob: Value = serde_json::from_str(&element.metadata)
            .map_err(|e| ObserverError::Host(format!("corrupt metadata on {}: {}", key, e)))?;
        let Some(object) = blob.as_object_mut() else {
            return Err(ObserverError::Host(format!("metadata on {} is not an object", key)));
        };
        let data = object
            .entry("data")
            .or_insert_with(|| Value::Object(Map::new()));
        let Some(data) = data.as_object_mut() else {
            return Err(ObserverError::Host(format!("data on {} is not an object", key)));
        };

        let result = edit(data);
        element.metadata = blob.to_string();
        Ok(result)
    }

    fn notify(&self, kind: &ListenerKind, signal: HostSignal) {
        let listeners: Vec<Listener> = self
            .state
            .lock()
            .listeners
            .values()
            .filter(|(k, _)| k == kind)
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(signal.clone());
        }
    }
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryHost")
            .field("elements", &state.elements.len())
            .field("listeners", &state.listeners.len())
            .finish()
    }
}

impl Host for MemoryHost {
    fn supports(&self, feature: HostFeature) -> bool {
        self.state.lock().features.contains(&feature)
    }

    fn elements(&self) -> Vec<HostElement> {
        self.state.lock().elements.clone()
    }

    fn element(&self, key: &str) -> Option<HostElement> {
        self.state
            .lock()
            .elements
            .iter()
            .find(|el| el.key == key)
            .cloned()
    }

    fn add_listener(&self, kind: ListenerKind, listener: Listener) -> ListenerId {
        let mut state = self.state.lock();
        let id = state.next_listener;
        state.next_listener += 1;
        state.listeners.insert(id, (kind, listener));
        id
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.state.lock().listeners.remove(&id).is_some()
    }

    fn has_live_handle(&self, key: &str) -> bool {
        let state = self.state.lock();
        !state.detached.contains(key) && state.elements.iter().any(|el| el.key == key)
    }

    fn set_property(&self, key: &str, property: &str, value: Value) -> Result<(), ObserverError> {
        self.edit_data(key, |data| {
            data.insert(property.to_string(), value);
        })?;
        self.fire_hook(self.update_hook(), key);
        Ok(())
    }

    fn call_method(&self, key: &str, method: &str, args: &[Value]) -> Result<Value, ObserverError> {
        let element = self
            .element(key)
            .ok_or_else(|| ObserverError::NotFound(format!("element {}", key)))?;
        let declared = serde_json::from_str::<Value>(&element.metadata)
            .ok()
            .and_then(|blob| blob.get("methods").cloned())
            .and_then(|m| m.as_array().cloned())
            .unwrap_or_default()
            .iter()
            .any(|m| m.get("name").and_then(Value::as_str) == Some(method));
        if !declared {
            return Err(ObserverError::NotFound(format!("method {} on {}", method, key)));
        }

        let handler = {
            let mut state = self.state.lock();
            state
                .calls
                .push((key.to_string(), method.to_string(), args.to_vec()));
            state.methods.get(method).cloned()
        };

        match handler {
            Some(handler) => {
                let result = self.edit_data(key, |data| handler(data, args))?;
                self.fire_hook(self.update_hook(), key);
                Ok(result)
            }
            None => Ok(Value::Null),
        }
    }

    fn highlight(&self, key: &str) {
        self.state.lock().highlighted.push(key.to_string());
    }
}
