//! Error types for the in-context engine.

use statescope_types::{Reason, Reply};
use thiserror::Error;

/// Errors raised by the event bus, component processor and snapshot store.
#[derive(Debug, Error)]
pub enum Error {
    /// A component, property or snapshot does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// Input failed validation (type mismatch, malformed import, bad pattern).
    #[error("invalid input: {0}")]
    Invalid(String),

    /// The operation is not allowed on this target (computed or protected property).
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The peer end of a port is gone.
    #[error("port disconnected")]
    Disconnected,

    /// Persistence failed.
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Result alias used throughout the SDK.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wire-level reason for this error.
    pub fn reason(&self) -> Reason {
        match self {
            Error::NotFound(_) => Reason::NotFound,
            Error::Invalid(_) | Error::Serialization(_) | Error::Config(_) => Reason::Invalid,
            Error::Forbidden(_) => Reason::Forbidden,
            Error::Disconnected => Reason::ChannelUnhealthy,
            Error::Storage(_) => Reason::Internal,
        }
    }

    /// Convert into a structured reply that is safe to send across a port.
    pub fn to_reply(&self) -> Reply {
        Reply::error(self.reason(), self.to_string())
    }
}

impl From<&Error> for Reply {
    fn from(err: &Error) -> Self {
        err.to_reply()
    }
}
