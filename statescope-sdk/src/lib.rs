//! # statescope-sdk
//!
//! The in-context engine behind statescope: everything that runs inside one
//! execution context and does not talk to a host framework or a peer.
//!
//! ## Quick Start
//!
//! ```rust
//! use serde_json::json;
//! use statescope_sdk::{Context, Settings};
//! use statescope_types::Component;
//!
//! # tokio_test::block_on(async {
//! let ctx = Context::new(Settings::default());
//!
//! let v1 = Component::builder("comp-1", "Counter").property("count", json!(0)).build();
//! let v2 = Component::builder("comp-1", "Counter").property("count", json!(5)).build();
//!
//! ctx.processor().process_component(v1.clone()).await.unwrap();
//! let before = ctx.snapshots().create_snapshot(&v1, Some("before")).await.unwrap();
//! ctx.processor().process_component(v2).await.unwrap();
//!
//! let changes = ctx.processor().property_changes("comp-1").await;
//! assert_eq!(changes[0].property, "count");
//!
//! let restored = ctx.snapshots().restore_snapshot(&before.id).await.unwrap();
//! assert_eq!(restored.state["count"], json!(0));
//! # });
//! ```
//!
//! ## Pieces
//!
//! - [`EventBus`]: pub/sub with history, debounce and throttle
//! - [`ComponentProcessor`]: canonical component index and change log
//! - [`SnapshotManager`]: bounded snapshot store with auto-capture
//! - [`Storage`]: persistence behind both stores
//! - [`Port`]: the only way contexts talk to each other
//! - [`Context`]: owns one of each for an execution context

mod context;
pub mod diff;
mod error;
mod event_bus;
mod port;
mod processor;
mod settings;
mod snapshots;
mod storage;
mod task;

pub use context::{Context, Ingested};
pub use error::{Error, Result};
pub use event_bus::{EventBus, SubscriberInfo, SubscriptionId, DEFAULT_HISTORY_LIMIT};
pub use port::{Port, PortSender};
pub use processor::{
    ComponentNode, ComponentProcessor, RenderMetrics, SlowRender, COMPONENTS_KEY,
    MAX_RENDER_SAMPLES, RECENT_RENDER_WINDOW,
};
pub use settings::{
    EventSettings, HealthSettings, PerformanceSettings, Settings, SnapshotSettings,
};
pub use snapshots::{CapacityPolicy, SnapshotManager, SNAPSHOTS_KEY};
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use task::TaskHandle;

// Re-export types for convenience
pub use statescope_types::{
    Component, Envelope, PropertyChange, Snapshot, SnapshotBundle, StateDiff, TimelineEvent,
};
