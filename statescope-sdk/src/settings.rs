//! Runtime settings.
//!
//! Every section has defaults, so an empty file (or no file at all) yields a
//! working configuration. Values can be overridden from the environment with
//! the `STATESCOPE` prefix and `__` as the section separator, e.g.
//! `STATESCOPE__SNAPSHOTS__MAX_SNAPSHOTS=100`.

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::snapshots::CapacityPolicy;
use crate::Result;

/// Top-level settings shared by every context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub snapshots: SnapshotSettings,
    pub events: EventSettings,
    pub health: HealthSettings,
    pub performance: PerformanceSettings,
}

impl Settings {
    /// Load settings from an optional file plus `STATESCOPE__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let config = builder
            .add_source(
                Environment::with_prefix("STATESCOPE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(config.try_deserialize()?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotSettings {
    pub max_snapshots: usize,
    /// Apply `max_snapshots` to each component instead of the whole store.
    pub per_component: bool,
    pub auto_enabled: bool,
    pub auto_interval_ms: u64,
}

impl SnapshotSettings {
    /// Capacity policy described by these settings.
    pub fn policy(&self) -> CapacityPolicy {
        let max = self.max_snapshots;
        if self.per_component {
            CapacityPolicy::PerComponent { max }
        } else {
            CapacityPolicy::Global { max }
        }
    }

    /// Settings whose [`policy`](Self::policy) is `policy`.
    pub fn with_policy(self, policy: CapacityPolicy) -> Self {
        Self {
            max_snapshots: policy.max(),
            per_component: matches!(policy, CapacityPolicy::PerComponent { .. }),
            ..self
        }
    }

    pub fn auto_interval(&self) -> Duration {
        Duration::from_millis(self.auto_interval_ms)
    }
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            max_snapshots: 50,
            per_component: false,
            auto_enabled: false,
            auto_interval_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventSettings {
    pub history_enabled: bool,
    pub history_limit: usize,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            history_enabled: true,
            history_limit: crate::event_bus::DEFAULT_HISTORY_LIMIT,
        }
    }
}

/// Channel health monitoring and reconnection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub ping_interval_ms: u64,
    /// Consecutive unanswered pings before a channel is declared a zombie.
    pub max_missed_pongs: u32,
    pub max_reconnect_attempts: u32,
    /// Delay before the first reconnect attempt; doubles on every retry.
    pub base_backoff_ms: u64,
    /// How long a Presentation waits for a `RESPONSE`.
    pub request_timeout_ms: u64,
}

impl HealthSettings {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            ping_interval_ms: 1_000,
            max_missed_pongs: 3,
            max_reconnect_attempts: 5,
            base_backoff_ms: 500,
            request_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceSettings {
    pub slow_render_threshold_ms: f64,
}

impl Default for PerformanceSettings {
    fn default() -> Self {
        Self {
            slow_render_threshold_ms: 16.0,
        }
    }
}
