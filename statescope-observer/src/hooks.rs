//! Lifecycle hook strategies.
//!
//! Hosts expose one of two incompatible hook APIs. The observer checks once
//! at initialization and sticks with the resulting [`HookStrategy`]; nothing
//! downstream branches on the host version again.

use crate::host::{Host, HostFeature, Listener, ListenerId, ListenerKind};

/// What a lifecycle hook means for the component index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Mount,
    Update,
    Unmount,
}

/// The two supported hook APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStrategy {
    /// Per-component callbacks.
    Legacy,
    /// One commit callback per render pass plus an unmount callback.
    Commit,
}

impl HookStrategy {
    /// Pick the strategy for a host. The commit API wins when both are offered.
    pub fn detect(host: &dyn Host) -> Option<Self> {
        if host.supports(HostFeature::CommitHooks) {
            Some(HookStrategy::Commit)
        } else if host.supports(HostFeature::LegacyHooks) {
            Some(HookStrategy::Legacy)
        } else {
            None
        }
    }

    /// Hook names this strategy listens to.
    pub fn lifecycle_names(&self) -> &'static [&'static str] {
        match self {
            HookStrategy::Legacy => &["mounted", "updated", "destroyed"],
            HookStrategy::Commit => &["commit", "unmount"],
        }
    }

    /// Register `listener` for every lifecycle hook.
    pub fn register_hooks(&self, host: &dyn Host, listener: Listener) -> Vec<ListenerId> {
        self.lifecycle_names()
            .iter()
            .map(|name| host.add_listener(ListenerKind::Hook(name.to_string()), listener.clone()))
            .collect()
    }

    /// Map a hook name to its meaning. A commit covers both first mount and
    /// re-render; the observer tells them apart by whether it knows the key.
    pub fn classify(&self, hook: &str) -> Option<Lifecycle> {
        match (self, hook) {
            (HookStrategy::Legacy, "mounted") => Some(Lifecycle::Mount),
            (HookStrategy::Legacy, "updated") => Some(Lifecycle::Update),
            (HookStrategy::Legacy, "destroyed") => Some(Lifecycle::Unmount),
            (HookStrategy::Commit, "commit") => Some(Lifecycle::Update),
            (HookStrategy::Commit, "unmount") => Some(Lifecycle::Unmount),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HookStrategy::Legacy => "legacy",
            HookStrategy::Commit => "commit",
        }
    }
}
