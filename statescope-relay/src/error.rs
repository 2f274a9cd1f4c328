//! Error types for the relay.

use statescope_types::{Reason, Reply};
use thiserror::Error;

use crate::registry::ConnectionId;

/// Errors raised while routing or reconnecting.
#[derive(Debug, Error)]
pub enum RelayError {
    /// No connection owns the addressed session or component.
    #[error("no route to {0}")]
    NoRoute(String),

    /// The connection is not registered.
    #[error("connection {0} not found")]
    UnknownConnection(ConnectionId),

    /// The target stopped answering pings or is being reconnected.
    #[error("connection {0} is unhealthy")]
    Unhealthy(ConnectionId),

    /// Reconnection attempts were used up; the connection is failed.
    #[error("connection {connection} exhausted after {attempts} reconnect attempts")]
    Exhausted { connection: ConnectionId, attempts: u32 },

    /// The connector could not produce a port.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The request payload was malformed.
    #[error("invalid request: {0}")]
    Invalid(String),

    #[error(transparent)]
    Sdk(#[from] statescope_sdk::Error),
}

impl RelayError {
    /// Wire-level reason for this error.
    pub fn reason(&self) -> Reason {
        match self {
            RelayError::NoRoute(_) | RelayError::UnknownConnection(_) => Reason::NotFound,
            RelayError::Unhealthy(_) | RelayError::Connect(_) => Reason::ChannelUnhealthy,
            RelayError::Exhausted { .. } => Reason::ChannelExhausted,
            RelayError::Invalid(_) => Reason::Invalid,
            RelayError::Sdk(e) => e.reason(),
        }
    }

    pub fn to_reply(&self) -> Reply {
        Reply::error(self.reason(), self.to_string())
    }
}
