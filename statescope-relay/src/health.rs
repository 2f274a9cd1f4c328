//! Per-connection health tracking.
//!
//! A [`HealthTracker`] is a pure state machine: the relay feeds it ping,
//! pong and disconnect observations and acts on the status it reports.
//! Statuses only move forward; [`HealthTracker::mark_connected`] is the one
//! way back to `Healthy`.

use std::time::Duration;

use statescope_sdk::HealthSettings;
use statescope_types::{ConnectionStatus, HealthMetrics};

/// Health monitoring knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthConfig {
    pub ping_interval: Duration,
    /// Consecutive unanswered pings before a connection is a zombie.
    pub max_missed_pongs: u32,
    pub max_reconnect_attempts: u32,
    /// Delay before the first reconnect attempt; doubles on every attempt.
    pub base_backoff: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self::from(&HealthSettings::default())
    }
}

impl From<&HealthSettings> for HealthConfig {
    fn from(settings: &HealthSettings) -> Self {
        Self {
            ping_interval: settings.ping_interval(),
            max_missed_pongs: settings.max_missed_pongs.max(1),
            max_reconnect_attempts: settings.max_reconnect_attempts,
            base_backoff: settings.base_backoff(),
        }
    }
}

impl HealthConfig {
    /// Delay before reconnect attempt `attempt` (1-based): `base * 2^(attempt-1)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_backoff.saturating_mul(factor)
    }
}

/// Health state of one connection.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    config: HealthConfig,
    status: ConnectionStatus,
    metrics: HealthMetrics,
    missed_pongs: u32,
    outstanding_ping: Option<u64>,
    attempts: u32,
    lost: bool,
}

impl HealthTracker {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            status: ConnectionStatus::Connecting,
            metrics: HealthMetrics::default(),
            missed_pongs: 0,
            outstanding_ping: None,
            attempts: 0,
            lost: false,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn metrics(&self) -> &HealthMetrics {
        &self.metrics
    }

    pub fn missed_pongs(&self) -> u32 {
        self.missed_pongs
    }

    /// Reconnect attempts made since the connection was lost.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Move to `next` if it is later than the current status.
    fn advance(&mut self, next: ConnectionStatus) -> bool {
        if next > self.status {
            self.status = next;
            true
        } else {
            false
        }
    }

    /// A port is attached and usable. Counts as a reconnection if the
    /// channel had been lost before.
    pub fn mark_connected(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        if self.lost {
            self.metrics.reconnect_count += 1;
            self.lost = false;
        }
        self.status = ConnectionStatus::Healthy;
        self.missed_pongs = 0;
        self.outstanding_ping = None;
        self.attempts = 0;
    }

    /// Record a ping sent at `now`. An earlier ping still unanswered counts
    /// as a miss. Returns the resulting status.
    pub fn ping_sent(&mut self, now: u64) -> ConnectionStatus {
        if self.outstanding_ping.is_some() {
            self.missed_pongs += 1;
            if self.missed_pongs >= self.config.max_missed_pongs {
                self.advance(ConnectionStatus::Unhealthy);
            } else {
                self.advance(ConnectionStatus::Degraded);
            }
        }
        self.outstanding_ping = Some(now);
        self.metrics.last_ping_at = Some(now);
        self.status
    }

    /// Record a pong echoing the ping timestamp `sent_at`.
    ///
    /// Resets the miss counter but does not lift a degraded status.
    pub fn pong_received(&mut self, sent_at: u64, now: u64) {
        self.metrics.latency = Some(now.saturating_sub(sent_at));
        self.metrics.last_pong_at = Some(now);
        self.missed_pongs = 0;
        self.outstanding_ping = None;
    }

    /// The port closed or was torn down.
    pub fn mark_disconnected(&mut self) {
        self.metrics.disconnects += 1;
        self.outstanding_ping = None;
        self.lost = true;
        self.advance(ConnectionStatus::Unhealthy);
    }

    /// Claim the next reconnect attempt. Returns its backoff delay, or
    /// `None` (and marks the connection failed) once attempts are used up.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if self.attempts >= self.config.max_reconnect_attempts {
            self.mark_failed();
            return None;
        }
        self.attempts += 1;
        Some(self.config.backoff(self.attempts))
    }

    pub fn mark_failed(&mut self) {
        self.advance(ConnectionStatus::Failed);
    }

    pub fn record_sent(&mut self) {
        self.metrics.messages_sent += 1;
    }

    pub fn record_received(&mut self) {
        self.metrics.messages_received += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HealthConfig {
        HealthConfig {
            ping_interval: Duration::from_millis(100),
            max_missed_pongs: 3,
            max_reconnect_attempts: 4,
            base_backoff: Duration::from_millis(50),
        }
    }

    #[test]
    fn consecutive_misses_make_a_zombie() {
        let mut health = HealthTracker::new(config());
        health.mark_connected();

        assert_eq!(health.ping_sent(0), ConnectionStatus::Healthy);
        assert_eq!(health.ping_sent(100), ConnectionStatus::Degraded);
        assert_eq!(health.ping_sent(200), ConnectionStatus::Degraded);
        assert_eq!(health.ping_sent(300), ConnectionStatus::Unhealthy);
        assert_eq!(health.missed_pongs(), 3);
    }

    #[test]
    fn pong_resets_misses_but_not_status() {
        let mut health = HealthTracker::new(config());
        health.mark_connected();

        health.ping_sent(0);
        health.ping_sent(100);
        health.pong_received(100, 112);

        assert_eq!(health.missed_pongs(), 0);
        assert_eq!(health.metrics().latency, Some(12));
        assert_eq!(health.status(), ConnectionStatus::Degraded);

        // Two more misses are not enough to reach the threshold again.
        health.ping_sent(200);
        assert_eq!(health.ping_sent(300), ConnectionStatus::Degraded);
    }

    #[test]
    fn backoff_strictly_increases_until_failed() {
        let mut health = HealthTracker::new(config());
        health.mark_connected();
        health.mark_disconnected();

        let delays: Vec<Duration> = std::iter::from_fn(|| health.next_backoff()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(50),
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
            ]
        );
        assert!(delays.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(health.status(), ConnectionStatus::Failed);
    }

    #[test]
    fn reconnection_returns_to_healthy() {
        let mut health = HealthTracker::new(config());
        health.mark_connected();
        health.mark_disconnected();
        health.next_backoff();

        health.mark_connected();
        assert_eq!(health.status(), ConnectionStatus::Healthy);
        assert_eq!(health.metrics().reconnect_count, 1);
        assert_eq!(health.metrics().disconnects, 1);
        assert_eq!(health.attempts(), 0);
    }

    #[test]
    fn failed_is_terminal() {
        let mut health = HealthTracker::new(HealthConfig {
            max_reconnect_attempts: 0,
            ..config()
        });
        health.mark_connected();
        health.mark_disconnected();
        assert!(health.next_backoff().is_none());

        health.mark_connected();
        assert_eq!(health.status(), ConnectionStatus::Failed);
    }

    #[test]
    fn defaults_follow_settings() {
        let config = HealthConfig::default();
        assert_eq!(config.ping_interval, Duration::from_millis(1000));
        assert_eq!(config.max_missed_pongs, 3);
        assert_eq!(config.backoff(3), Duration::from_millis(2000));
    }
}
