//! # statescope
//!
//! A live component inspector with cross-context state sync and time travel.
//!
//! The workspace splits along execution contexts:
//!
//! ```text
//! ┌────────────────┐   Port    ┌──────────────────┐   Port    ┌──────────────────┐
//! │    Observer    │◀─────────▶│      Relay       │◀─────────▶│   Presentation   │
//! │ (page context) │           │ index, snapshots │           │  (this crate)    │
//! │  host signals  │           │ health, routing  │           │ InspectorView    │
//! └────────────────┘           └──────────────────┘           └──────────────────┘
//! ```
//!
//! - [`observer`]: scans a host's component tree and forwards changes
//! - [`relay`]: the central context; owns the component index, the event
//!   history and the snapshot store, and routes commands to observers
//! - [`sdk`]: the engine pieces shared by both (event bus, processor,
//!   snapshot manager, ports, settings)
//! - [`types`]: the wire model
//!
//! This crate adds the presentation side: a [`PresentationClient`] that
//! speaks the command surface and folds broadcasts into an [`InspectorView`].
//!
//! ## Usage
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use statescope::observer::{MemoryHost, Observer};
//! use statescope::relay::Relay;
//! use statescope::sdk::{Context, EventBus, Port, Settings};
//! use statescope::PresentationClient;
//!
//! # tokio_test::block_on(async {
//! let relay = Relay::new(Context::new(Settings::default()));
//!
//! let host = Arc::new(MemoryHost::new());
//! let observer = Observer::new(host, EventBus::new());
//! let (page, relay_side) = Port::pair();
//! relay.attach_observer(observer.session_id(), relay_side);
//! observer.connect(page);
//!
//! let (ui, relay_side) = Port::pair();
//! relay.attach_presentation(relay_side);
//! let client = PresentationClient::connect(ui, Duration::from_secs(1));
//! assert!(client.get_components().await.unwrap().is_empty());
//! # });
//! ```

pub mod client;
pub mod error;
pub mod logging;
pub mod source;
pub mod view;

pub use client::PresentationClient;
pub use error::ClientError;
pub use logging::{init_logging, init_logging_with, DEFAULT_LOG_FILTER};
pub use source::ViewSource;
pub use view::{ConnectionAlert, InspectorView, MAX_VIEW_EVENTS};

pub use statescope_observer as observer;
pub use statescope_relay as relay;
pub use statescope_sdk as sdk;
pub use statescope_types as types;
