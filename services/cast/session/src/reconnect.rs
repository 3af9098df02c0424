//! Reconnect schedule.

use crate::state::ErrorCause;
use std::time::Duration;

/// Backoff schedule and retry limit for reconnecting to a device
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Retries after the first attempt; `None` retries forever
    pub max_retries: Option<u32>,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound on the delay
    pub max_backoff: Duration,
    /// Growth factor between consecutive retries
    pub multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: None,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl ReconnectPolicy {
    /// Give up after the first failure
    pub fn never() -> Self {
        Self {
            max_retries: Some(0),
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based), or `None` once the limit
    /// is reached
    pub fn delay_for(&self, retry: u32) -> Option<Duration> {
        if retry == 0 {
            return Some(Duration::ZERO);
        }
        if matches!(self.max_retries, Some(max) if retry > max) {
            return None;
        }

        let factor = self.multiplier.max(1.0).powi(retry.saturating_sub(1) as i32);
        let delay = self.initial_backoff.as_secs_f64() * factor;
        let capped = delay.min(self.max_backoff.as_secs_f64()).max(0.0);
        // Near Duration::MAX the f64 round trip overflows; clamp to the cap
        Some(
            Duration::try_from_secs_f64(capped)
                .map_or(self.max_backoff, |delay| delay.min(self.max_backoff)),
        )
    }

    /// Whether a connection that ended with `cause` should be retried at all
    pub fn should_retry(&self, cause: &ErrorCause) -> bool {
        cause.is_retryable() && self.max_retries != Some(0)
    }
}
