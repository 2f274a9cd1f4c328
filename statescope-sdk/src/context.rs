//! Per-context runtime state.
//!
//! A [`Context`] is created once when an execution context starts and handed
//! to every subsystem that runs in it. It replaces module-level registries:
//! there is no global bus, index or settings object.

use std::sync::Arc;

use serde_json::json;
use statescope_types::{Component, IngestRecord, RecordKind, TimelineEvent};
use tracing::{debug, info};

use crate::event_bus::EventBus;
use crate::processor::ComponentProcessor;
use crate::settings::Settings;
use crate::snapshots::SnapshotManager;
use crate::storage::{MemoryStorage, Storage};
use crate::{Error, Result};

/// What an ingested record turned into.
#[derive(Debug, Clone, PartialEq)]
pub enum Ingested {
    /// A component record, merged into the index.
    Component(Component),
    /// Any other record, published on the bus.
    Event(TimelineEvent),
}

/// Runtime state shared by the subsystems of one context.
#[derive(Debug, Clone)]
pub struct Context {
    settings: Arc<Settings>,
    bus: EventBus,
    processor: Arc<ComponentProcessor>,
    snapshots: SnapshotManager,
    storage: Arc<dyn Storage>,
}

impl Context {
    /// Create a context backed by in-memory storage.
    pub fn new(settings: Settings) -> Self {
        Self::with_storage(settings, Arc::new(MemoryStorage::new()))
    }

    /// Create a context persisting into `storage`.
    pub fn with_storage(settings: Settings, storage: Arc<dyn Storage>) -> Self {
        let bus = EventBus::new();
        if settings.events.history_enabled {
            bus.enable_history_tracking(settings.events.history_limit);
        }

        let processor = ComponentProcessor::new(storage.clone());
        let snapshots = SnapshotManager::with_settings(storage.clone(), settings.snapshots.clone());

        Self {
            settings: Arc::new(settings),
            bus,
            processor: Arc::new(processor),
            snapshots,
            storage,
        }
    }

    /// Load persisted components and snapshots and apply performance settings.
    pub async fn restore(&self) -> Result<()> {
        self.processor
            .set_slow_render_threshold(self.settings.performance.slow_render_threshold_ms)
            .await;
        let components = self.processor.load().await?;
        let snapshots = self.snapshots.load().await?;
        info!(components, snapshots, "Context restored from storage");
        Ok(())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn processor(&self) -> &Arc<ComponentProcessor> {
        &self.processor
    }

    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Push a collector record into the core.
    ///
    /// Component records must match the component schema and are merged
    /// into the index. Every other kind is published on the bus under its
    /// kind's topic, with the attributes as payload.
    pub async fn ingest(&self, record: IngestRecord) -> Result<Ingested> {
        match record.kind {
            RecordKind::Component => {
                let component: Component = serde_json::from_value(record.attributes_value())
                    .map_err(|e| Error::Invalid(format!("component record: {}", e)))?;
                let stored = self.processor.process_component(component).await?;
                self.bus.publish(
                    "component:updated",
                    json!({"componentId": stored.id, "name": stored.name}),
                );
                Ok(Ingested::Component(stored))
            }
            kind => {
                let mut event = self.bus.event(kind.topic(), record.attributes_value());
                event.timestamp = record.timestamp;
                debug!(topic = kind.topic(), "Ingested record published");
                self.bus.publish_event(event.clone());
                Ok(Ingested::Event(event))
            }
        }
    }

    /// Stop timers, then release subscriptions.
    pub fn shutdown(&self) {
        self.snapshots.stop_auto_snapshots();
        self.bus.unsubscribe_all_events();
        info!("Context shut down");
    }
}
