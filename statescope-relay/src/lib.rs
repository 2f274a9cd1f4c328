//! # statescope-relay
//!
//! The broker between observers and presentations. A [`Relay`] keeps a
//! registry of connections, merges observer reports into its own
//! [`Context`](statescope_sdk::Context), broadcasts them to every
//! presentation, and answers presentation requests. Commands that need a
//! live component (edits, method calls, highlights, snapshot restores) are
//! forwarded to the observer that owns it, and the observer's answer is
//! handed back under the presentation's original timestamp.
//!
//! ## Health
//!
//! Each connection is pinged periodically. Unanswered pings first degrade a
//! connection and, after `max_missed_pongs` in a row, mark it a zombie: its
//! port is torn down and, if it was opened through a [`Connector`], it is
//! reconnected with exponential backoff. Running out of attempts marks it
//! failed for good, publishes `connection:failed` on the relay's bus and
//! broadcasts a `CONNECTION_STATUS` carrying `ChannelExhausted`.
//!
//! ```rust
//! use statescope_relay::Relay;
//! use statescope_sdk::{Context, Port, Settings};
//!
//! # tokio_test::block_on(async {
//! let relay = Relay::new(Context::new(Settings::default()));
//! let (_inspector, far) = Port::pair();
//! let id = relay.attach_presentation(far);
//! assert_eq!(relay.connections()[0].connection_id, id);
//! relay.stop();
//! # });
//! ```

mod connector;
mod error;
mod health;
mod registry;
mod relay;

pub use connector::Connector;
pub use error::RelayError;
pub use health::{HealthConfig, HealthTracker};
pub use registry::ConnectionId;
pub use relay::{Relay, TOPIC_CONNECTION_FAILED};
