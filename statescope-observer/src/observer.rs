//! The observer: mirrors a host's component tree onto the local event bus and
//! a relay port, and applies commands coming back.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::{json, Value};
use statescope_sdk::{EventBus, Port, PortSender, SubscriptionId};
use statescope_types::{
    Action, Component, ComponentId, Envelope, IngestRecord, MethodCall, Reply, TimelineEvent,
    UpdatePayload,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::hooks::{HookStrategy, Lifecycle};
use crate::host::{Host, HostElement, HostFeature, HostSignal, ListenerId, ListenerKind, Mutation};
use crate::metadata::parse_metadata;
use crate::ObserverError;

/// Bus topic for newly seen components.
pub const TOPIC_COMPONENT_ADDED: &str = "component:added";
/// Bus topic for re-rendered components.
pub const TOPIC_COMPONENT_UPDATED: &str = "component:updated";
/// Bus topic for unmounted components.
pub const TOPIC_COMPONENT_REMOVED: &str = "component:removed";

#[derive(Debug, Clone)]
struct Tracked {
    component: Component,
    parent: Option<String>,
}

#[derive(Default)]
struct ObserverState {
    initialized: bool,
    strategy: Option<HookStrategy>,
    listeners: Vec<ListenerId>,
    /// Keyed by host element key.
    tracked: HashMap<String, Tracked>,
    keys_by_id: HashMap<ComponentId, String>,
    link: Option<RelayLink>,
}

struct RelayLink {
    sender: PortSender,
    forwarding: SubscriptionId,
    reader: JoinHandle<()>,
}

struct ObserverInner {
    host: Arc<dyn Host>,
    bus: EventBus,
    session_id: String,
    state: Mutex<ObserverState>,
}

/// Watches one host and talks to one relay.
///
/// Cloning is cheap; clones share the same observation session.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use serde_json::json;
/// use statescope_observer::{MemoryHost, Observer};
/// use statescope_sdk::EventBus;
///
/// let host = Arc::new(MemoryHost::new());
/// host.add_element("counter", None, json!({"name": "Counter", "data": {"count": 0}}));
///
/// let observer = Observer::new(host.clone(), EventBus::new());
/// assert_eq!(observer.initialize().unwrap(), 1);
///
/// observer.update_component_property("counter", "count", json!(5)).unwrap();
/// assert_eq!(host.data("counter").unwrap()["count"], json!(5));
///
/// observer.stop();
/// assert_eq!(host.listener_count(), 0);
/// ```
#[derive(Clone)]
pub struct Observer {
    inner: Arc<ObserverInner>,
}

impl Observer {
    /// Create an observer for `host`, publishing on `bus`. Nothing is scanned
    /// until [`initialize`](Self::initialize).
    pub fn new(host: Arc<dyn Host>, bus: EventBus) -> Self {
        Self {
            inner: Arc::new(ObserverInner {
                host,
                bus,
                session_id: uuid::Uuid::new_v4().to_string(),
                state: Mutex::new(ObserverState::default()),
            }),
        }
    }

    /// Identifier of this observation session.
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// The hook API selected at initialization, if the host offers one.
    pub fn strategy(&self) -> Option<HookStrategy> {
        self.inner.state.lock().strategy
    }

    /// Every component currently tracked.
    pub fn components(&self) -> Vec<Component> {
        let mut components: Vec<Component> = self
            .inner
            .state
            .lock()
            .tracked
            .values()
            .map(|t| t.component.clone())
            .collect();
        components.sort_by(|a, b| a.id.cmp(&b.id));
        components
    }

    pub fn component(&self, id: &str) -> Option<Component> {
        let state = self.inner.state.lock();
        let key = state.keys_by_id.get(id)?;
        state.tracked.get(key).map(|t| t.component.clone())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Select the hook strategy, arm hooks and mutation watching, and emit one
    /// `component:added` per instrumented element.
    ///
    /// Elements with malformed metadata are logged and skipped. Calling this
    /// again on a running observer does nothing and returns the number of
    /// tracked components.
    pub fn initialize(&self) -> Result<usize, ObserverError> {
        {
            let state = self.inner.state.lock();
            if state.initialized {
                return Ok(state.tracked.len());
            }
        }

        let host = self.inner.host.as_ref();
        let strategy = HookStrategy::detect(host);
        let weak = Arc::downgrade(&self.inner);
        let listener: crate::host::Listener = Arc::new(move |signal: HostSignal| {
            if let Some(inner) = weak.upgrade() {
                let observer = Observer { inner };
                observer.on_signal(signal);
            }
        });

        let mut listeners = Vec::new();
        if let Some(strategy) = strategy {
            listeners.extend(strategy.register_hooks(host, listener.clone()));
        }
        if host.supports(HostFeature::MutationWatch) {
            listeners.push(host.add_listener(ListenerKind::Mutations, listener));
        }

        {
            let mut state = self.inner.state.lock();
            state.initialized = true;
            state.strategy = strategy;
            state.listeners = listeners;
        }

        let emitted = self.scan();
        info!(
            session = %self.inner.session_id,
            strategy = strategy.map(|s| s.name()).unwrap_or("none"),
            components = emitted,
            "Observer initialized"
        );
        Ok(emitted)
    }

    /// Unregister every host listener, drop the relay link and forget all
    /// tracked components.
    pub fn stop(&self) {
        let (listeners, link) = {
            let mut state = self.inner.state.lock();
            state.initialized = false;
            state.strategy = None;
            state.tracked.clear();
            state.keys_by_id.clear();
            (std::mem::take(&mut state.listeners), state.link.take())
        };

        for id in listeners {
            self.inner.host.remove_listener(id);
        }
        if let Some(link) = link {
            self.close_link(link);
        }
        info!(session = %self.inner.session_id, "Observer stopped");
    }

    fn scan(&self) -> usize {
        let elements = self.inner.host.elements();

        let mut parsed: Vec<(HostElement, Component)> = Vec::with_capacity(elements.len());
        for element in elements {
            match parse_metadata(&element) {
                Ok(component) => parsed.push((element, component)),
                Err(e) => warn!(key = %element.key, error = %e, "Skipping element with malformed metadata"),
            }
        }

        let ids_by_key: HashMap<&str, &str> = parsed
            .iter()
            .map(|(el, c)| (el.key.as_str(), c.id.as_str()))
            .collect();

        let mut linked = Vec::with_capacity(parsed.len());
        for (element, component) in &parsed {
            let mut component = component.clone();
            if let Some(parent_id) = element.parent.as_deref().and_then(|p| ids_by_key.get(p)) {
                component.ancestor_ids.push(parent_id.to_string());
            }
            component.children_ids = parsed
                .iter()
                .filter(|(child, _)| child.parent.as_deref() == Some(element.key.as_str()))
                .map(|(_, c)| c.id.clone())
                .collect();
            linked.push((element.key.clone(), element.parent.clone(), component));
        }

        let count = linked.len();
        for (key, parent, component) in linked {
            self.track(key, parent, component.clone());
            self.emit(TOPIC_COMPONENT_ADDED, &component);
        }
        count
    }

    // ========================================================================
    // Host signals
    // ========================================================================

    fn on_signal(&self, signal: HostSignal) {
        match signal {
            HostSignal::Mutation(Mutation::Added(element)) => self.on_added(element),
            HostSignal::Mutation(Mutation::Removed(key)) => self.on_removed(&key),
            HostSignal::Mutation(Mutation::Changed(key)) => self.on_changed(&key),
            HostSignal::Lifecycle { hook, key } => {
                let strategy = self.inner.state.lock().strategy;
                match strategy.and_then(|s| s.classify(&hook)) {
                    Some(Lifecycle::Mount) | Some(Lifecycle::Update) => {
                        if self.is_tracked(&key) {
                            self.on_changed(&key);
                        } else if let Some(element) = self.inner.host.element(&key) {
                            self.on_added(element);
                        }
                    }
                    Some(Lifecycle::Unmount) => self.on_removed(&key),
                    None => debug!(hook = %hook, "Ignoring unknown lifecycle hook"),
                }
            }
        }
    }

    fn on_added(&self, element: HostElement) {
        if self.is_tracked(&element.key) {
            self.on_changed(&element.key);
            return;
        }

        let mut component = match parse_metadata(&element) {
            Ok(component) => component,
            Err(e) => {
                warn!(key = %element.key, error = %e, "Skipping element with malformed metadata");
                return;
            }
        };

        let parent_id = element.parent.as_deref().and_then(|p| self.component_id_of(p));
        if let Some(parent_id) = &parent_id {
            component.ancestor_ids.push(parent_id.clone());
        }
        self.track(element.key.clone(), element.parent.clone(), component.clone());
        self.emit(TOPIC_COMPONENT_ADDED, &component);

        // The parent gained a child.
        if let Some(parent_key) = element.parent.as_deref() {
            let parent = {
                let mut state = self.inner.state.lock();
                state.tracked.get_mut(parent_key).map(|t| {
                    if !t.component.children_ids.contains(&component.id) {
                        t.component.children_ids.push(component.id.clone());
                    }
                    t.component.clone()
                })
            };
            if let Some(parent) = parent {
                self.emit(TOPIC_COMPONENT_UPDATED, &parent);
            }
        }
    }

    fn on_changed(&self, key: &str) {
        let Some(element) = self.inner.host.element(key) else {
            return;
        };
        let fresh = match parse_metadata(&element) {
            Ok(component) => component,
            Err(e) => {
                warn!(key = %key, error = %e, "Ignoring update with malformed metadata");
                return;
            }
        };

        let updated = {
            let mut state = self.inner.state.lock();
            let Some(tracked) = state.tracked.get_mut(key) else {
                return;
            };
            let mut next = fresh;
            next.id = tracked.component.id.clone();
            next.ancestor_ids = tracked.component.ancestor_ids.clone();
            next.children_ids = tracked.component.children_ids.clone();
            next.mount_time = tracked.component.mount_time;
            if next == tracked.component {
                None
            } else {
                tracked.component = next.clone();
                Some(next)
            }
        };

        if let Some(component) = updated {
            self.emit(TOPIC_COMPONENT_UPDATED, &component);
        }
    }

    /// Emit a removal for every tracked descendant of `key`, deepest first,
    /// then for `key` itself.
    fn on_removed(&self, key: &str) {
        let removed: Vec<Component> = {
            let mut state = self.inner.state.lock();
            if !state.tracked.contains_key(key) {
                return;
            }

            let mut order = vec![key.to_string()];
            let mut i = 0;
            while i < order.len() {
                let current = order[i].clone();
                for (child_key, tracked) in &state.tracked {
                    if tracked.parent.as_deref() == Some(current.as_str()) && !order.contains(child_key) {
                        order.push(child_key.clone());
                    }
                }
                i += 1;
            }

            order
                .iter()
                .rev()
                .filter_map(|k| {
                    let tracked = state.tracked.remove(k)?;
                    state.keys_by_id.remove(&tracked.component.id);
                    Some(tracked.component)
                })
                .collect()
        };

        for component in &removed {
            self.inner.bus.publish(
                TOPIC_COMPONENT_REMOVED,
                json!({"componentId": component.id, "name": component.name}),
            );
        }
        debug!(root = %key, count = removed.len(), "Subtree removed");
    }

    fn track(&self, key: String, parent: Option<String>, component: Component) {
        let mut state = self.inner.state.lock();
        state.keys_by_id.insert(component.id.clone(), key.clone());
        state.tracked.insert(key, Tracked { component, parent });
    }

    fn is_tracked(&self, key: &str) -> bool {
        self.inner.state.lock().tracked.contains_key(key)
    }

    fn component_id_of(&self, key: &str) -> Option<ComponentId> {
        self.inner
            .state
            .lock()
            .tracked
            .get(key)
            .map(|t| t.component.id.clone())
    }

    fn emit(&self, topic: &str, component: &Component) {
        let payload = match serde_json::to_value(component) {
            Ok(value) => json!({"componentId": component.id, "component": value}),
            Err(e) => {
                warn!(component = %component.id, error = %e, "Failed to serialize component");
                return;
            }
        };
        self.inner.bus.publish(topic, payload);
    }

    // ========================================================================
    // Commands
    // ========================================================================

    fn live_key(&self, id: &str) -> Result<String, ObserverError> {
        let key = self
            .inner
            .state
            .lock()
            .keys_by_id
            .get(id)
            .cloned()
            .ok_or_else(|| ObserverError::NotFound(format!("component {}", id)))?;
        if !self.inner.host.has_live_handle(&key) {
            return Err(ObserverError::NotFound(format!("live handle for {}", id)));
        }
        Ok(key)
    }

    /// Write a property through the host's own setter.
    pub fn update_component_property(
        &self,
        id: &str,
        property: &str,
        value: Value,
    ) -> Result<(), ObserverError> {
        let key = self.live_key(id)?;
        self.inner.host.set_property(&key, property, value)
    }

    /// Apply an edit prepared by the relay, rejecting it if the component
    /// has been restructured since.
    pub fn apply_update(&self, update: &UpdatePayload) -> Result<(), ObserverError> {
        if let Some(current) = self.component(&update.component_id) {
            if !update.fingerprint.is_empty() && update.fingerprint != current.fingerprint {
                return Err(ObserverError::Invalid(format!(
                    "stale fingerprint for {}: expected {}, got {}",
                    update.component_id, current.fingerprint, update.fingerprint
                )));
            }
        }
        self.update_component_property(&update.component_id, &update.property, update.value.clone())
    }

    pub fn execute_method(&self, id: &str, method: &str, args: &[Value]) -> Result<Value, ObserverError> {
        let key = self.live_key(id)?;
        self.inner.host.call_method(&key, method, args)
    }

    /// Visually mark a component. No state changes.
    pub fn highlight_component(&self, id: &str) -> Result<(), ObserverError> {
        let key = self.live_key(id)?;
        self.inner.host.highlight(&key);
        Ok(())
    }

    // ========================================================================
    // Relay link
    // ========================================================================

    /// Attach to a relay over `port`.
    ///
    /// Every bus event is forwarded as an envelope, every tracked component is
    /// re-announced, and commands arriving on the port are answered. A
    /// previous link is closed first. Must be called within a tokio runtime.
    pub fn connect(&self, port: Port) {
        if let Some(previous) = self.inner.state.lock().link.take() {
            self.close_link(previous);
        }

        let (sender, mut receiver) = port.split();

        let forward_to = sender.clone();
        let forwarding = match self.inner.bus.subscribe_many_with_regex(".*", move |event| {
            forward_to.send(envelope_for(event))?;
            Ok(())
        }) {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "Failed to arm forwarding");
                return;
            }
        };

        let weak: Weak<ObserverInner> = Arc::downgrade(&self.inner);
        let reply_to = sender.clone();
        let session = self.inner.session_id.clone();
        let reader = tokio::spawn(async move {
            while let Some(envelope) = receiver.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let observer = Observer { inner };
                if let Some(reply) = observer.handle_envelope(&envelope) {
                    if reply_to.send(reply).is_err() {
                        break;
                    }
                }
            }
            debug!(session = %session, "Relay port closed");
        });

        for component in self.components() {
            if let Ok(value) = serde_json::to_value(&component) {
                let _ = sender.send(Envelope::new(Action::ComponentAdded, value));
            }
        }

        self.inner.state.lock().link = Some(RelayLink {
            sender,
            forwarding,
            reader,
        });
        info!(session = %self.inner.session_id, "Connected to relay");
    }

    /// Check whether a relay link is attached and its peer is still there.
    pub fn is_connected(&self) -> bool {
        self.inner
            .state
            .lock()
            .link
            .as_ref()
            .is_some_and(|l| !l.sender.is_closed() && !l.reader.is_finished())
    }

    /// Drop the relay link without stopping observation.
    pub fn disconnect(&self) {
        if let Some(link) = self.inner.state.lock().link.take() {
            self.close_link(link);
        }
    }

    /// Forward a collector record to the relay.
    pub fn send_record(&self, record: &IngestRecord) -> Result<(), ObserverError> {
        let sender = self
            .inner
            .state
            .lock()
            .link
            .as_ref()
            .map(|l| l.sender.clone())
            .ok_or(ObserverError::NotConnected)?;
        let payload = serde_json::to_value(record).map_err(statescope_sdk::Error::from)?;
        sender.send(Envelope::new(Action::Ingest, payload))?;
        Ok(())
    }

    fn close_link(&self, link: RelayLink) {
        self.inner.bus.unsubscribe(link.forwarding);
        link.reader.abort();
    }

    /// Answer one envelope from the relay. Returns the reply to send, if any.
    pub fn handle_envelope(&self, envelope: &Envelope) -> Option<Envelope> {
        let result: Result<Value, ObserverError> = match envelope.action {
            Action::Ping => {
                return Some(Envelope::new(Action::Pong, Value::Null).with_timestamp(envelope.timestamp));
            }
            Action::UpdateComponent => decode::<UpdatePayload>(envelope)
                .and_then(|update| self.apply_update(&update))
                .map(|_| Value::Null),
            Action::ExecuteMethod => decode::<MethodCall>(envelope)
                .and_then(|call| self.execute_method(&call.component_id, &call.method, &call.args)),
            Action::HighlightComponent => component_id(&envelope.payload)
                .and_then(|id| self.highlight_component(&id))
                .map(|_| Value::Null),
            Action::ApplyState => self.apply_state(&envelope.payload).map(|n| json!({"applied": n})),
            Action::GetComponents => {
                serde_json::to_value(self.components()).map_err(|e| statescope_sdk::Error::from(e).into())
            }
            other => {
                debug!(action = ?other, "Observer ignoring action");
                return None;
            }
        };

        let reply = match result {
            Ok(data) => Reply::ok(data),
            Err(e) => {
                debug!(action = ?envelope.action, error = %e, "Command failed");
                e.to_reply()
            }
        };
        Some(Envelope::response_to(envelope, reply))
    }

    /// Restore a set of property values, e.g. from a snapshot.
    ///
    /// Payload: `{componentId, fingerprint?, state: {prop: value}}`. Every
    /// property is checked against the tracked component before the first
    /// write, so a rejected entry leaves the page untouched. If the host
    /// fails part way, the properties already written are put back to their
    /// previous values. Returns how many properties were written.
    fn apply_state(&self, payload: &Value) -> Result<usize, ObserverError> {
        let id = component_id(payload)?;
        let state = payload
            .get("state")
            .and_then(Value::as_object)
            .ok_or_else(|| ObserverError::Invalid("missing state".into()))?;
        let fingerprint = payload
            .get("fingerprint")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let key = self.live_key(&id)?;
        let current = self
            .component(&id)
            .ok_or_else(|| ObserverError::NotFound(format!("component {}", id)))?;
        if !fingerprint.is_empty() && fingerprint != current.fingerprint {
            return Err(ObserverError::Invalid(format!(
                "stale fingerprint for {}: expected {}, got {}",
                id, current.fingerprint, fingerprint
            )));
        }

        for (property, value) in state {
            let prop = current
                .properties
                .get(property)
                .ok_or_else(|| ObserverError::NotFound(format!("property {} on {}", property, id)))?;
            if !prop.is_editable() {
                return Err(statescope_sdk::Error::Forbidden(format!("property {} on {}", property, id)).into());
            }
            if !prop.kind.accepts(value) {
                return Err(ObserverError::Invalid(format!(
                    "property {} on {} expects {}",
                    property,
                    id,
                    prop.kind.as_str()
                )));
            }
        }

        let mut written: Vec<&String> = Vec::with_capacity(state.len());
        for (property, value) in state {
            if let Err(e) = self.inner.host.set_property(&key, property, value.clone()) {
                warn!(component = %id, property = %property, error = %e, "State restore failed, rolling back");
                for done in written.iter().rev() {
                    let Some(previous) = current.properties.get(done.as_str()) else {
                        continue;
                    };
                    if let Err(undo) = self.inner.host.set_property(&key, done, previous.value.clone()) {
                        warn!(component = %id, property = %done, error = %undo, "Rollback write failed");
                    }
                }
                let done: Vec<&str> = written.iter().map(|p| p.as_str()).collect();
                return Err(ObserverError::Host(format!(
                    "writing {} on {}: {} (rolled back: [{}])",
                    property,
                    id,
                    e,
                    done.join(", ")
                )));
            }
            written.push(property);
        }
        Ok(written.len())
    }
}

impl std::fmt::Debug for Observer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Observer")
            .field("session_id", &self.inner.session_id)
            .field("initialized", &state.initialized)
            .field("strategy", &state.strategy)
            .field("components", &state.tracked.len())
            .field("connected", &state.link.is_some())
            .finish()
    }
}

fn decode<T: serde::de::DeserializeOwned>(envelope: &Envelope) -> Result<T, ObserverError> {
    envelope
        .decode_payload()
        .map_err(|e| ObserverError::Invalid(format!("{:?} payload: {}", envelope.action, e)))
}

fn component_id(payload: &Value) -> Result<String, ObserverError> {
    payload
        .get("componentId")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ObserverError::Invalid("missing componentId".into()))
}

/// Envelope carrying a local bus event to the relay.
fn envelope_for(event: &TimelineEvent) -> Envelope {
    let action = match event.event_type.as_str() {
        TOPIC_COMPONENT_ADDED => Action::ComponentAdded,
        TOPIC_COMPONENT_UPDATED => Action::ComponentUpdated,
        TOPIC_COMPONENT_REMOVED => Action::ComponentRemoved,
        _ => Action::EventRecorded,
    };
    let payload = match action {
        Action::ComponentAdded | Action::ComponentUpdated => {
            event.payload.get("component").cloned().unwrap_or(Value::Null)
        }
        Action::ComponentRemoved => event.payload.clone(),
        _ => serde_json::to_value(event).unwrap_or(Value::Null),
    };
    Envelope::new(action, payload).with_timestamp(event.timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryHost;
    use statescope_types::Reason;
    use std::time::Duration;

    fn counter_meta(count: i64) -> Value {
        json!({
            "id": "comp-1",
            "name": "Counter",
            "fingerprint": "f1",
            "data": {"count": count, "title": "My Counter", "double": count * 2, "token": "t"},
            "computed": ["double"],
            "protected": ["token"],
            "methods": [{"name": "increment", "params": []}]
        })
    }

    fn setup() -> (Arc<MemoryHost>, Observer) {
        let host = Arc::new(MemoryHost::new());
        host.add_element("app", None, json!({"id": "app", "name": "App"}));
        host.add_element("counter", Some("app"), counter_meta(0));
        host.add_element("label", Some("counter"), json!({"id": "label", "name": "Label"}));
        let observer = Observer::new(host.clone(), EventBus::new());
        (host, observer)
    }

    fn recorder(bus: &EventBus, topic: &str) -> Arc<Mutex<Vec<TimelineEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        bus.subscribe(topic, move |event| {
            s.lock().push(event.clone());
            Ok(())
        });
        seen
    }

    #[test]
    fn initialize_scans_and_links_hierarchy() {
        let (_host, observer) = setup();
        let added = recorder(observer.bus(), TOPIC_COMPONENT_ADDED);

        assert_eq!(observer.initialize().unwrap(), 3);
        assert_eq!(added.lock().len(), 3);

        let counter = observer.component("comp-1").unwrap();
        assert_eq!(counter.ancestor_ids, vec!["app"]);
        assert_eq!(counter.children_ids, vec!["label"]);
        assert_eq!(observer.strategy(), Some(HookStrategy::Legacy));
    }

    #[test]
    fn initialize_is_idempotent() {
        let (host, observer) = setup();
        observer.initialize().unwrap();
        let listeners = host.listener_count();

        assert_eq!(observer.initialize().unwrap(), 3);
        assert_eq!(host.listener_count(), listeners);
    }

    #[test]
    fn malformed_metadata_is_skipped() {
        let host = Arc::new(MemoryHost::new());
        host.add_element("a", None, json!({"name": "A"}));
        host.add_raw_element("broken", None, "{oops");
        host.add_element("b", None, json!({"name": "B"}));

        let observer = Observer::new(host, EventBus::new());
        assert_eq!(observer.initialize().unwrap(), 2);
    }

    #[test]
    fn subtree_removal_emits_every_descendant() {
        let (host, observer) = setup();
        observer.initialize().unwrap();
        let removed = recorder(observer.bus(), TOPIC_COMPONENT_REMOVED);

        host.remove_element("app");

        let ids: Vec<String> = removed
            .lock()
            .iter()
            .map(|e| e.payload["componentId"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["label", "comp-1", "app"]);
        assert!(observer.components().is_empty());
    }

    #[test]
    fn added_elements_are_tracked() {
        let (host, observer) = setup();
        observer.initialize().unwrap();
        let added = recorder(observer.bus(), TOPIC_COMPONENT_ADDED);

        host.add_element("late", Some("app"), json!({"id": "late", "name": "Late"}));

        assert_eq!(added.lock().len(), 1);
        assert_eq!(observer.component("late").unwrap().ancestor_ids, vec!["app"]);
        assert!(observer.component("app").unwrap().children_ids.contains(&"late".to_string()));
    }

    #[test]
    fn edits_go_through_the_host_setter() {
        let (host, observer) = setup();
        observer.initialize().unwrap();
        let updated = recorder(observer.bus(), TOPIC_COMPONENT_UPDATED);

        observer
            .update_component_property("comp-1", "count", json!(5))
            .unwrap();

        assert_eq!(host.data("counter").unwrap()["count"], json!(5));
        assert_eq!(updated.lock().len(), 1);
        assert_eq!(
            observer.component("comp-1").unwrap().properties["count"].value,
            json!(5)
        );
    }

    #[test]
    fn commands_without_live_handle_are_not_found() {
        let (host, observer) = setup();
        observer.initialize().unwrap();
        host.detach("counter");

        let err = observer
            .update_component_property("comp-1", "count", json!(1))
            .unwrap_err();
        assert_eq!(err.reason(), Reason::NotFound);
        assert!(observer.execute_method("comp-1", "increment", &[]).is_err());
        assert!(observer.highlight_component("ghost").is_err());
    }

    #[test]
    fn stale_fingerprint_is_rejected() {
        let (_host, observer) = setup();
        observer.initialize().unwrap();

        let err = observer
            .apply_update(&UpdatePayload {
                component_id: "comp-1".into(),
                fingerprint: "old".into(),
                property: "count".into(),
                value: json!(1),
            })
            .unwrap_err();
        assert_eq!(err.reason(), Reason::Invalid);
    }

    #[test]
    fn rejected_state_entry_writes_nothing() {
        let (host, observer) = setup();
        observer.initialize().unwrap();

        let mistyped = observer
            .apply_state(&json!({
                "componentId": "comp-1",
                "fingerprint": "f1",
                "state": {"count": 7, "title": 5}
            }))
            .unwrap_err();
        assert_eq!(mistyped.reason(), Reason::Invalid);

        let protected = observer
            .apply_state(&json!({
                "componentId": "comp-1",
                "state": {"count": 7, "token": "stolen"}
            }))
            .unwrap_err();
        assert_eq!(protected.reason(), Reason::Forbidden);

        let unknown = observer
            .apply_state(&json!({
                "componentId": "comp-1",
                "state": {"count": 7, "zzz": 1}
            }))
            .unwrap_err();
        assert_eq!(unknown.reason(), Reason::NotFound);

        let data = host.data("counter").unwrap();
        assert_eq!(data["count"], json!(0));
        assert_eq!(data["token"], json!("t"));

        let applied = observer
            .apply_state(&json!({
                "componentId": "comp-1",
                "fingerprint": "f1",
                "state": {"count": 7, "title": "Seven"}
            }))
            .unwrap();
        assert_eq!(applied, 2);
        assert_eq!(host.data("counter").unwrap()["title"], json!("Seven"));
    }

    #[test]
    fn highlight_and_methods_reach_the_host() {
        let (host, observer) = setup();
        observer.initialize().unwrap();

        observer.highlight_component("comp-1").unwrap();
        assert_eq!(host.highlighted(), vec!["counter"]);

        observer.execute_method("comp-1", "increment", &[json!(1)]).unwrap();
        assert_eq!(host.calls()[0].1, "increment");
    }

    #[test]
    fn stop_leaves_no_listener_behind() {
        let (host, observer) = setup();
        observer.initialize().unwrap();
        assert!(host.listener_count() > 0);

        observer.stop();
        assert_eq!(host.listener_count(), 0);

        // Further host activity is not observed.
        let added = recorder(observer.bus(), TOPIC_COMPONENT_ADDED);
        host.add_element("after", None, json!({"name": "After"}));
        assert!(added.lock().is_empty());
    }

    #[test]
    fn commit_strategy_tracks_updates() {
        let host = Arc::new(MemoryHost::with_features(&[
            HostFeature::CommitHooks,
            HostFeature::MutationWatch,
        ]));
        host.add_element("counter", None, counter_meta(0));
        let observer = Observer::new(host.clone(), EventBus::new());
        observer.initialize().unwrap();
        assert_eq!(observer.strategy(), Some(HookStrategy::Commit));

        host.set_property("counter", "count", json!(9)).unwrap();
        assert_eq!(
            observer.component("comp-1").unwrap().properties["count"].value,
            json!(9)
        );

        host.fire_hook("unmount", "counter");
        assert!(observer.component("comp-1").is_none());
    }

    #[tokio::test]
    async fn relay_link_forwards_and_answers() {
        let (host, observer) = setup();
        observer.initialize().unwrap();

        let (local, mut relay) = Port::pair();
        observer.connect(local);
        assert!(observer.is_connected());

        // Resync of the three tracked components.
        for _ in 0..3 {
            assert_eq!(relay.recv().await.unwrap().action, Action::ComponentAdded);
        }

        relay
            .send(Envelope::new(Action::Ping, Value::Null).with_timestamp(77))
            .unwrap();
        let pong = relay.recv().await.unwrap();
        assert_eq!(pong.action, Action::Pong);
        assert_eq!(pong.timestamp, 77);

        let request = Envelope::new(
            Action::UpdateComponent,
            json!({"componentId": "comp-1", "fingerprint": "f1", "property": "count", "value": 4}),
        )
        .with_timestamp(100);
        relay.send(request).unwrap();

        // The edit re-renders the component before the response goes out.
        let updated = relay.recv().await.unwrap();
        assert_eq!(updated.action, Action::ComponentUpdated);
        assert_eq!(updated.payload["properties"]["count"]["value"], json!(4));

        let response = relay.recv().await.unwrap();
        assert_eq!(response.action, Action::Response);
        assert_eq!(response.timestamp, 100);
        assert_eq!(response.payload["ok"], json!(true));
        assert_eq!(host.data("counter").unwrap()["count"], json!(4));

        let missing = Envelope::new(
            Action::ExecuteMethod,
            json!({"componentId": "ghost", "method": "x"}),
        )
        .with_timestamp(101);
        relay.send(missing).unwrap();
        let response = relay.recv().await.unwrap();
        assert_eq!(response.payload["reason"], json!("NotFound"));
    }

    #[tokio::test]
    async fn closing_the_relay_port_ends_the_link() {
        let (_host, observer) = setup();
        observer.initialize().unwrap();

        let (local, relay) = Port::pair();
        observer.connect(local);
        drop(relay);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!observer.is_connected());
        assert!(matches!(
            observer.send_record(&IngestRecord {
                kind: statescope_types::RecordKind::Query,
                attributes: Default::default(),
                timestamp: 1,
            }),
            Err(ObserverError::Sdk(statescope_sdk::Error::Disconnected))
        ));

        observer.stop();
        assert_eq!(observer.bus().subscription_count(), 0);
    }
}
