//! Connection health types reported by the relay.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a relay connection.
///
/// Statuses are ordered; a connection only ever moves to a later status,
/// except that a successful reconnection returns it to `Healthy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Connecting,
    Healthy,
    Degraded,
    Unhealthy,
    Failed,
}

impl ConnectionStatus {
    /// Returns a short symbol for display.
    pub fn symbol(&self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "...",
            ConnectionStatus::Healthy => "OK",
            ConnectionStatus::Degraded => "WARN",
            ConnectionStatus::Unhealthy => "ZOMB",
            ConnectionStatus::Failed => "FAIL",
        }
    }

    /// `Failed` is terminal: no automatic retries follow it.
    pub fn is_terminal(&self) -> bool {
        *self == ConnectionStatus::Failed
    }

    /// Check whether commands may be routed over the connection.
    pub fn is_usable(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::Connecting | ConnectionStatus::Healthy | ConnectionStatus::Degraded
        )
    }
}

/// Health metrics tracked per connection.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMetrics {
    /// Round trip time of the last answered ping, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_ping_at: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_pong_at: Option<u64>,

    /// Successful reconnections.
    pub reconnect_count: u32,

    /// Times the channel was lost (closed by the peer or torn down as a zombie).
    pub disconnects: u32,

    pub messages_sent: u64,
    pub messages_received: u64,
}

/// Which side of the relay a connection belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum ConnectionRole {
    /// An Observer running in an instrumented page, addressed by session id.
    Observer {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    /// An inspection surface.
    Presentation,
}

impl ConnectionRole {
    /// Session id for observer connections.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ConnectionRole::Observer { session_id } => Some(session_id),
            ConnectionRole::Presentation => None,
        }
    }
}

/// Point-in-time report for one connection, as answered to `GET_CONNECTION_STATUS`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionReport {
    pub connection_id: u64,
    pub role: ConnectionRole,
    pub status: ConnectionStatus,
    pub metrics: HealthMetrics,
}
