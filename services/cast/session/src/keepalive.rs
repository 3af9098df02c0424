//! Heartbeat with PING/PONG on the heartbeat namespace.
//!
//! The sender pings the platform every `ping_interval`. Any PONG clears the
//! outstanding ping; a ping left unanswered for longer than `pong_timeout`
//! means the peer is dead.

use cast_wire::{Message, NS_HEARTBEAT, PLATFORM_DESTINATION_ID, TYPE_PING, TYPE_PONG};
use serde_json::json;
use std::time::Duration;
use tokio::time::Instant;

/// Default interval between pings
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(10);

/// Default bound on waiting for a PONG
pub const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Build a PING for the platform receiver
pub fn build_ping(source_id: &str) -> Message {
    Message::json(
        NS_HEARTBEAT,
        source_id,
        PLATFORM_DESTINATION_ID,
        json!({ "type": TYPE_PING }),
    )
}

/// Build a PONG in response to a PING
pub fn build_pong(source_id: &str) -> Message {
    Message::json(
        NS_HEARTBEAT,
        source_id,
        PLATFORM_DESTINATION_ID,
        json!({ "type": TYPE_PONG }),
    )
}

/// Heartbeat timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between pings
    pub ping_interval: Duration,
    /// How long a ping may stay unanswered
    pub pong_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            pong_timeout: DEFAULT_PONG_TIMEOUT,
        }
    }
}

/// Heartbeat tracking for one connection
#[derive(Debug)]
pub struct Heartbeat {
    config: HeartbeatConfig,
    next_ping: Instant,
    /// Send time of the oldest unanswered ping
    outstanding: Option<Instant>,
}

impl Heartbeat {
    /// Start tracking; the first ping is due one interval from `now`
    pub fn new(config: HeartbeatConfig, now: Instant) -> Self {
        Self {
            config,
            next_ping: now + config.ping_interval,
            outstanding: None,
        }
    }

    /// Whether a ping should be sent
    pub fn ping_due(&self, now: Instant) -> bool {
        now >= self.next_ping
    }

    /// Record a ping written at `now`
    pub fn ping_sent(&mut self, now: Instant) {
        if self.outstanding.is_none() {
            self.outstanding = Some(now);
        }
        self.next_ping = now + self.config.ping_interval;
    }

    /// Record a PONG; returns the round trip of the oldest outstanding ping
    pub fn pong_received(&mut self, now: Instant) -> Option<Duration> {
        self.outstanding
            .take()
            .map(|sent| now.saturating_duration_since(sent))
    }

    /// Whether the outstanding ping has gone unanswered for too long
    pub fn is_expired(&self, now: Instant) -> bool {
        self.outstanding
            .map(|sent| now.saturating_duration_since(sent) >= self.config.pong_timeout)
            .unwrap_or(false)
    }

    /// Earliest instant at which [`ping_due`](Self::ping_due) or
    /// [`is_expired`](Self::is_expired) can change
    pub fn next_deadline(&self) -> Instant {
        match self.outstanding {
            Some(sent) => self.next_ping.min(sent + self.config.pong_timeout),
            None => self.next_ping,
        }
    }
}
