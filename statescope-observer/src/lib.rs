//! # statescope-observer
//!
//! The in-page half of statescope. An [`Observer`] attaches to a [`Host`]
//! (anything that owns a live component tree), turns instrumented elements
//! into [`Component`](statescope_types::Component) records, and keeps them
//! current by listening to lifecycle hooks and structural mutations.
//!
//! Everything it learns is published on a local
//! [`EventBus`](statescope_sdk::EventBus) and, once connected, forwarded to a
//! relay over a [`Port`](statescope_sdk::Port). Commands coming back from the
//! relay (property edits, method calls, highlights, state restores) are
//! applied through the host's own setters.
//!
//! Two hook APIs are supported, selected once by probing the host:
//!
//! - [`HookStrategy::Legacy`]: per-component `mounted` / `updated` / `destroyed`
//! - [`HookStrategy::Commit`]: one `commit` per render pass plus `unmount`
//!
//! [`MemoryHost`] is an in-memory host for tests and demos.

mod error;
mod hooks;
pub mod host;
mod memory;
mod metadata;
mod observer;

pub use error::ObserverError;
pub use hooks::{HookStrategy, Lifecycle};
pub use host::{Host, HostElement, HostFeature, HostSignal, Listener, ListenerId, ListenerKind, Mutation};
pub use memory::{MemoryHost, MethodHandler};
pub use metadata::parse_metadata;
pub use observer::{Observer, TOPIC_COMPONENT_ADDED, TOPIC_COMPONENT_REMOVED, TOPIC_COMPONENT_UPDATED};
