//! The presentation-side view model.
//!
//! An [`InspectorView`] is rebuilt incrementally from the envelopes a relay
//! broadcasts. It holds no handles into other contexts: everything in it is
//! an owned copy that a rendering layer can read at leisure.

use std::collections::{BTreeMap, VecDeque};

use statescope_types::{
    Action, Component, ComponentId, ConnectionReport, ConnectionStatus, Envelope, Reason,
    TimelineEvent,
};

/// Maximum number of timeline events kept in the view.
pub const MAX_VIEW_EVENTS: usize = 200;

/// A connection the relay gave up on.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionAlert {
    pub connection_id: u64,
    pub session_id: Option<String>,
    pub reason: Reason,
}

/// Mirror of the relay state as seen by one presentation.
#[derive(Debug, Clone, Default)]
pub struct InspectorView {
    pub components: BTreeMap<ComponentId, Component>,
    /// Most recent events, oldest first.
    pub events: VecDeque<TimelineEvent>,
    pub connections: BTreeMap<u64, ConnectionReport>,
    /// Terminal failures surfaced to the operator.
    pub alerts: Vec<ConnectionAlert>,
    /// Broadcasts applied so far.
    pub revision: u64,
}

impl InspectorView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one relay broadcast into the view. Returns whether it changed.
    pub fn apply(&mut self, envelope: &Envelope) -> bool {
        let changed = match envelope.action {
            Action::ComponentAdded | Action::ComponentUpdated => {
                match serde_json::from_value::<Component>(envelope.payload.clone()) {
                    Ok(component) => {
                        self.components.insert(component.id.clone(), component);
                        true
                    }
                    Err(_) => false,
                }
            }
            Action::ComponentRemoved => envelope
                .payload
                .get("componentId")
                .and_then(|v| v.as_str())
                .is_some_and(|id| self.components.remove(id).is_some()),
            Action::EventRecorded => {
                match serde_json::from_value::<TimelineEvent>(envelope.payload.clone()) {
                    Ok(event) => {
                        self.events.push_back(event);
                        if self.events.len() > MAX_VIEW_EVENTS {
                            self.events.pop_front();
                        }
                        true
                    }
                    Err(_) => false,
                }
            }
            Action::DataCleared => {
                self.components.clear();
                self.events.clear();
                true
            }
            Action::ConnectionStatus => self.apply_status(envelope),
            _ => false,
        };

        if changed {
            self.revision += 1;
        }
        changed
    }

    fn apply_status(&mut self, envelope: &Envelope) -> bool {
        let Some(report) = envelope
            .payload
            .get("connection")
            .and_then(|v| serde_json::from_value::<ConnectionReport>(v.clone()).ok())
        else {
            return false;
        };

        let reason = envelope
            .payload
            .get("reason")
            .and_then(|v| serde_json::from_value::<Reason>(v.clone()).ok());
        if let Some(reason) = reason {
            self.alerts.push(ConnectionAlert {
                connection_id: report.connection_id,
                session_id: report.role.session_id().map(str::to_string),
                reason,
            });
        }

        self.connections.insert(report.connection_id, report);
        true
    }

    /// Replace the component set wholesale, e.g. from a `GET_COMPONENTS` answer.
    pub fn reset_components(&mut self, components: Vec<Component>) {
        self.components = components.into_iter().map(|c| (c.id.clone(), c)).collect();
        self.revision += 1;
    }

    /// Components with no known ancestor, by id.
    pub fn roots(&self) -> Vec<&Component> {
        self.components
            .values()
            .filter(|c| {
                c.ancestor_ids
                    .iter()
                    .all(|id| !self.components.contains_key(id))
            })
            .collect()
    }

    /// Direct children of a component that are present in the view.
    pub fn children(&self, id: &str) -> Vec<&Component> {
        self.components
            .get(id)
            .map(|c| {
                c.children_ids
                    .iter()
                    .filter_map(|child| self.components.get(child))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Worst status across all connections.
    pub fn overall_status(&self) -> Option<ConnectionStatus> {
        self.connections.values().map(|r| r.status).max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use statescope_types::{ConnectionRole, HealthMetrics};

    fn component_envelope(action: Action, id: &str, ancestor: Option<&str>) -> Envelope {
        let mut builder = Component::builder(id, id.to_uppercase()).property("count", json!(0));
        if let Some(parent) = ancestor {
            builder = builder.ancestor(parent);
        }
        Envelope::new(action, serde_json::to_value(builder.build()).unwrap())
    }

    #[test]
    fn component_broadcasts_build_a_tree() {
        let mut view = InspectorView::new();
        let mut root = Component::builder("app", "App").child("child").build();
        root.mount_time = 1;
        view.apply(&Envelope::new(Action::ComponentAdded, serde_json::to_value(&root).unwrap()));
        view.apply(&component_envelope(Action::ComponentAdded, "child", Some("app")));

        let roots: Vec<&str> = view.roots().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(roots, vec!["app"]);
        assert_eq!(view.children("app")[0].id, "child");

        let removed = Envelope::new(Action::ComponentRemoved, json!({"componentId": "app"}));
        assert!(view.apply(&removed));
        assert_eq!(view.roots()[0].id, "child");
        assert_eq!(view.revision, 3);
    }

    #[test]
    fn events_are_bounded() {
        let mut view = InspectorView::new();
        for i in 0..(MAX_VIEW_EVENTS as u64 + 5) {
            let event = TimelineEvent::new(i, "query", json!({}), i);
            view.apply(&Envelope::new(Action::EventRecorded, serde_json::to_value(event).unwrap()));
        }
        assert_eq!(view.events.len(), MAX_VIEW_EVENTS);
        assert_eq!(view.events.front().unwrap().id, 5);
    }

    #[test]
    fn exhausted_connections_raise_alerts() {
        let mut view = InspectorView::new();
        let report = ConnectionReport {
            connection_id: 4,
            role: ConnectionRole::Observer {
                session_id: "s1".into(),
            },
            status: ConnectionStatus::Failed,
            metrics: HealthMetrics::default(),
        };
        view.apply(&Envelope::new(
            Action::ConnectionStatus,
            json!({"connection": report, "reason": "ChannelExhausted"}),
        ));

        assert_eq!(view.overall_status(), Some(ConnectionStatus::Failed));
        assert_eq!(view.alerts[0].reason, Reason::ChannelExhausted);
        assert_eq!(view.alerts[0].session_id.as_deref(), Some("s1"));
    }

    #[test]
    fn clear_and_unknown_actions() {
        let mut view = InspectorView::new();
        view.apply(&component_envelope(Action::ComponentUpdated, "a", None));
        assert!(!view.apply(&Envelope::new(Action::Ping, json!(null))));
        assert!(view.apply(&Envelope::new(Action::DataCleared, json!(null))));
        assert!(view.components.is_empty());
    }
}
