//! Tracing setup for hosts embedding statescope.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::ClientError;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str =
    "statescope=info,statescope_sdk=info,statescope_relay=info,statescope_observer=info";

/// Install a global fmt subscriber filtered by `RUST_LOG`, falling back to
/// [`DEFAULT_LOG_FILTER`].
pub fn init_logging() -> Result<(), ClientError> {
    init_logging_with(DEFAULT_LOG_FILTER)
}

/// Like [`init_logging`] with a caller-supplied fallback filter.
///
/// Fails if a global subscriber is already installed.
pub fn init_logging_with(default_filter: &str) -> Result<(), ClientError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
        .map_err(|e| ClientError::Logging(e.to_string()))
}
