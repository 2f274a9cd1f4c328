//! Timeline events and the ingestion record contract.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ComponentId;

/// A single item on the inspector timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEvent {
    pub id: u64,

    /// Event type, doubling as the bus topic (e.g. `component:updated`, `query`).
    #[serde(rename = "type")]
    pub event_type: String,

    pub name: String,

    /// Unix timestamp in milliseconds.
    pub timestamp: u64,

    #[serde(default)]
    pub payload: Value,

    /// Component that produced the event, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ComponentId>,
}

impl TimelineEvent {
    /// Build an event for a topic. The source component is taken from a
    /// `componentId` string in the payload when present.
    pub fn new(id: u64, topic: &str, payload: Value, timestamp: u64) -> Self {
        let source = payload
            .get("componentId")
            .and_then(Value::as_str)
            .map(str::to_string);
        Self {
            id,
            event_type: topic.to_string(),
            name: topic.to_string(),
            timestamp,
            payload,
            source,
        }
    }

    /// Override the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Kind of a record pushed in by a framework-level collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordKind {
    Component,
    Query,
    ModelEvent,
    HttpRequest,
}

impl RecordKind {
    /// Event type used when the record is published on the bus.
    pub fn topic(&self) -> &'static str {
        match self {
            RecordKind::Component => "component",
            RecordKind::Query => "query",
            RecordKind::ModelEvent => "model-event",
            RecordKind::HttpRequest => "http-request",
        }
    }
}

/// A raw record from a framework-level collector.
///
/// Component records must conform to the [`Component`](crate::Component)
/// schema; all other kinds are passed through opaquely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestRecord {
    pub kind: RecordKind,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    pub timestamp: u64,
}

impl IngestRecord {
    /// Attributes as a JSON object.
    pub fn attributes_value(&self) -> Value {
        Value::Object(
            self.attributes
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn source_is_taken_from_payload() {
        let event = TimelineEvent::new(1, "component:updated", json!({"componentId": "c1"}), 10);
        assert_eq!(event.source.as_deref(), Some("c1"));

        let event = TimelineEvent::new(2, "query", json!({"sql": "select 1"}), 10);
        assert_eq!(event.source, None);
    }

    #[test]
    fn record_kind_uses_kebab_case() {
        let record: IngestRecord = serde_json::from_value(json!({
            "kind": "http-request",
            "attributes": {"url": "/login"},
            "timestamp": 5
        }))
        .unwrap();

        assert_eq!(record.kind, RecordKind::HttpRequest);
        assert_eq!(record.kind.topic(), "http-request");
        assert_eq!(record.attributes_value(), json!({"url": "/login"}));
    }
}
