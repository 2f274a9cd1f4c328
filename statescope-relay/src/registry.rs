//! The connection registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use statescope_sdk::PortSender;
use statescope_types::{ConnectionReport, ConnectionRole, ConnectionStatus, Envelope};
use tokio::task::JoinHandle;

use crate::connector::Connector;
use crate::health::{HealthConfig, HealthTracker};

/// Relay-assigned connection identifier.
pub type ConnectionId = u64;

/// One registered endpoint.
pub(crate) struct Connection {
    pub role: ConnectionRole,
    /// `None` while torn down or reconnecting.
    pub sender: Option<PortSender>,
    pub reader: Option<JoinHandle<()>>,
    pub reconnect: Option<JoinHandle<()>>,
    pub connector: Option<Arc<dyn Connector>>,
    pub health: HealthTracker,
    /// Bumped on every new port so a stale reader cannot tear down its successor.
    pub generation: u64,
}

impl Connection {
    /// Drop the port and stop its reader. Tasks are aborted, not awaited.
    pub fn teardown(&mut self) {
        self.sender = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }

    /// Send over the live port, counting the message.
    pub fn send(&mut self, envelope: Envelope) -> bool {
        let sent = self
            .sender
            .as_ref()
            .is_some_and(|sender| sender.send(envelope).is_ok());
        if sent {
            self.health.record_sent();
        }
        sent
    }

    pub fn report(&self, id: ConnectionId) -> ConnectionReport {
        ConnectionReport {
            connection_id: id,
            role: self.role.clone(),
            status: self.health.status(),
            metrics: self.health.metrics().clone(),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.teardown();
        if let Some(task) = self.reconnect.take() {
            task.abort();
        }
    }
}

/// Every connection the relay knows about, by id.
#[derive(Default)]
pub(crate) struct ConnectionRegistry {
    connections: BTreeMap<ConnectionId, Connection>,
    next_id: ConnectionId,
}

impl ConnectionRegistry {
    pub fn insert(
        &mut self,
        role: ConnectionRole,
        connector: Option<Arc<dyn Connector>>,
        config: HealthConfig,
    ) -> ConnectionId {
        self.next_id += 1;
        let id = self.next_id;
        self.connections.insert(
            id,
            Connection {
                role,
                sender: None,
                reader: None,
                reconnect: None,
                connector,
                health: HealthTracker::new(config),
                generation: 0,
            },
        );
        id
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        self.connections.remove(&id)
    }

    /// The newest observer connection registered for a session.
    pub fn observer_by_session(&self, session_id: &str) -> Option<ConnectionId> {
        self.connections
            .iter()
            .rev()
            .find(|(_, c)| c.role.session_id() == Some(session_id))
            .map(|(id, _)| *id)
    }

    pub fn presentations(&self) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|(_, c)| c.role == ConnectionRole::Presentation)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Connections with a live port that should be pinged.
    pub fn pingable(&self) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|(_, c)| c.sender.is_some() && c.health.status().is_usable())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn reports(&self) -> Vec<ConnectionReport> {
        self.connections
            .iter()
            .map(|(id, c)| c.report(*id))
            .collect()
    }

    pub fn status(&self, id: ConnectionId) -> Option<ConnectionStatus> {
        self.connections.get(&id).map(|c| c.health.status())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn clear(&mut self) {
        self.connections.clear();
    }
}
