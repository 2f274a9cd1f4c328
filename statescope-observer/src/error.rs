//! Error types for the observer.

use statescope_types::{Reason, Reply};
use thiserror::Error;

/// Errors raised while observing a host or applying remote commands.
#[derive(Debug, Error)]
pub enum ObserverError {
    /// No live handle (or no such method/property) for the addressed component.
    #[error("{0} not found")]
    NotFound(String),

    /// An element's metadata blob could not be parsed.
    #[error("malformed metadata on element {key}: {reason}")]
    Metadata { key: String, reason: String },

    /// A command payload was malformed or referred to a stale fingerprint.
    #[error("invalid command: {0}")]
    Invalid(String),

    /// The host rejected an operation.
    #[error("host error: {0}")]
    Host(String),

    /// No relay connection is attached.
    #[error("observer is not connected")]
    NotConnected,

    #[error(transparent)]
    Sdk(#[from] statescope_sdk::Error),
}

impl ObserverError {
    /// Wire-level reason for this error.
    pub fn reason(&self) -> Reason {
        match self {
            ObserverError::NotFound(_) => Reason::NotFound,
            ObserverError::Metadata { .. } | ObserverError::Invalid(_) => Reason::Invalid,
            ObserverError::Host(_) => Reason::Internal,
            ObserverError::NotConnected => Reason::ChannelUnhealthy,
            ObserverError::Sdk(e) => e.reason(),
        }
    }

    pub fn to_reply(&self) -> Reply {
        Reply::error(self.reason(), self.to_string())
    }
}
