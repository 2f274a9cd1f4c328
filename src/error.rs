//! Error types for the presentation client.

use statescope_types::{Action, Reason};
use thiserror::Error;

/// Errors surfaced to code driving a [`PresentationClient`](crate::PresentationClient).
#[derive(Debug, Error)]
pub enum ClientError {
    /// The relay answered with `ok: false`.
    #[error("{action:?} failed ({reason}): {message}")]
    Remote {
        action: Action,
        reason: Reason,
        message: String,
    },

    /// No `RESPONSE` arrived within the request timeout.
    #[error("{0:?} timed out")]
    Timeout(Action),

    /// The relay port is closed.
    #[error("relay disconnected")]
    Disconnected,

    /// A response payload did not have the expected shape.
    #[error("unexpected response: {0}")]
    Decode(#[from] serde_json::Error),

    /// Installing the log subscriber failed.
    #[error("logging setup failed: {0}")]
    Logging(String),
}

impl ClientError {
    /// Wire-level reason, if the error came from the other side.
    pub fn reason(&self) -> Option<Reason> {
        match self {
            ClientError::Remote { reason, .. } => Some(*reason),
            ClientError::Timeout(_) | ClientError::Disconnected => Some(Reason::ChannelUnhealthy),
            ClientError::Decode(_) | ClientError::Logging(_) => None,
        }
    }

    /// Check whether the relay gave up on the target connection.
    pub fn is_exhausted(&self) -> bool {
        self.reason() == Some(Reason::ChannelExhausted)
    }
}

impl From<statescope_sdk::Error> for ClientError {
    fn from(err: statescope_sdk::Error) -> Self {
        match err {
            statescope_sdk::Error::Disconnected => ClientError::Disconnected,
            statescope_sdk::Error::Serialization(e) => ClientError::Decode(e),
            other => ClientError::Remote {
                action: Action::Unknown,
                reason: other.reason(),
                message: other.to_string(),
            },
        }
    }
}
