//! The seam between the observer and the instrumented host.
//!
//! A [`Host`] is whatever owns the live component tree: it lists
//! instrumented elements, notifies listeners about structural mutations and
//! lifecycle hooks, and applies edits through its own setters.

use std::sync::Arc;

use serde_json::Value;

use crate::ObserverError;

/// Identifier of a listener registered on a host.
pub type ListenerId = u64;

/// Callback invoked by the host. Hosts must not hold internal locks while
/// calling it.
pub type Listener = Arc<dyn Fn(HostSignal) + Send + Sync>;

/// Optional host capabilities, discovered by probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostFeature {
    /// Per-component lifecycle callbacks (`mounted`, `updated`, `destroyed`).
    LegacyHooks,
    /// A single commit callback fired after each render pass.
    CommitHooks,
    /// Structural mutation notifications.
    MutationWatch,
}

/// An instrumented element as exposed by the host.
#[derive(Debug, Clone, PartialEq)]
pub struct HostElement {
    /// Host-side handle key.
    pub key: String,
    /// Key of the nearest instrumented ancestor element.
    pub parent: Option<String>,
    /// Raw embedded metadata (JSON).
    pub metadata: String,
}

/// Structural change in the host's element tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Added(HostElement),
    /// Subtree rooted at this key was removed. Descendants are not reported.
    Removed(String),
    /// Metadata of this element changed.
    Changed(String),
}

/// What a listener is notified about.
#[derive(Debug, Clone, PartialEq)]
pub enum HostSignal {
    Mutation(Mutation),
    Lifecycle { hook: String, key: String },
}

/// What a listener subscribes to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    Mutations,
    Hook(String),
}

/// Live component host.
pub trait Host: Send + Sync {
    /// Check whether the host offers a capability.
    fn supports(&self, feature: HostFeature) -> bool;

    /// Every instrumented element, parents before children.
    fn elements(&self) -> Vec<HostElement>;

    fn element(&self, key: &str) -> Option<HostElement>;

    fn add_listener(&self, kind: ListenerKind, listener: Listener) -> ListenerId;

    /// Returns whether the listener was registered.
    fn remove_listener(&self, id: ListenerId) -> bool;

    /// Check whether the element still has a live component behind it.
    fn has_live_handle(&self, key: &str) -> bool;

    /// Write a property through the component's own setter.
    fn set_property(&self, key: &str, property: &str, value: Value) -> Result<(), ObserverError>;

    fn call_method(&self, key: &str, method: &str, args: &[Value]) -> Result<Value, ObserverError>;

    /// Visually mark the element. Has no effect on component state.
    fn highlight(&self, key: &str);
}
