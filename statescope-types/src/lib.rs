//! # statescope-types
//!
//! Core types for live component inspection. This crate defines the schema
//! that the three statescope contexts (Observer, Relay, Presentation) exchange
//! over their channels. Nothing here owns behavior; every type is a plain
//! value that can be copied across a context boundary.
//!
//! ## Design Goals
//!
//! - **Value semantics**: components, snapshots and events are owned values,
//!   never references into another context's memory
//! - **Id links, not pointers**: hierarchy is expressed as id lists that are
//!   rebuilt into trees on demand
//! - **Closed action set**: every message carries an [`Action`] from a fixed
//!   enumeration; unknown actions deserialize to [`Action::Unknown`]
//! - **Versioned exports**: snapshot bundles include a [`SchemaVersion`]
//!
//! ## Example
//!
//! ```rust
//! use statescope_types::{Component, Visibility};
//! use serde_json::json;
//!
//! let component = Component::builder("comp-1", "counter")
//!     .fingerprint("f1")
//!     .property("count", json!(0))
//!     .property("title", json!("My Counter"))
//!     .property_with("secret", json!("x"), |p| p.visibility(Visibility::Protected))
//!     .method("increment", &[])
//!     .build();
//!
//! assert!(component.properties["count"].is_editable());
//! assert!(!component.properties["secret"].is_editable());
//! assert_eq!(component.state().len(), 3);
//! ```

mod component;
mod connection;
mod event;
mod message;
mod snapshot;
mod version;

pub use component::*;
pub use connection::*;
pub use event::*;
pub use message::*;
pub use snapshot::*;
pub use version::*;

/// Current schema version.
///
/// Increment this when making breaking changes to the export bundle format.
pub const SCHEMA_VERSION: u32 = 1;

/// Get current timestamp in milliseconds since Unix epoch.
pub fn current_timestamp_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
