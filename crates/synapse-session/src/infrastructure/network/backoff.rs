//! Exponential backoff for the client's reconnect loop.
//!
//! The first retry waits `initial_backoff`; each following one waits
//! `multiplier` times longer, capped at `max_backoff`.  With `max_attempts`
//! set, [`Backoff::next_delay`] returns `None` once that many attempts have
//! failed, and the caller stops retrying.

use std::time::Duration;

use tracing::debug;

/// Retry schedule settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Maximum number of connection attempts (`None` = retry forever).
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

/// Tracks failed attempts and the delay before the next one.
#[derive(Debug)]
pub struct Backoff {
    config: ReconnectConfig,
    current: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current: config.initial_backoff,
            config,
            failures: 0,
        }
    }

    /// Records a failed attempt and returns how long to wait before the next
    /// one, or `None` if the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if let Some(max) = self.config.max_attempts {
            if self.failures >= max {
                return None;
            }
        }

        let delay = self.current;
        let grown = self.current.as_secs_f64() * self.config.multiplier;
        self.current = Duration::from_secs_f64(grown.min(self.config.max_backoff.as_secs_f64()))
            .max(self.config.initial_backoff);
        Some(delay)
    }

    /// Starts the schedule over after a successful connection.
    pub fn reset(&mut self) {
        if self.failures > 0 {
            debug!(failures = self.failures, "resetting reconnect backoff");
        }
        self.current = self.config.initial_backoff;
        self.failures = 0;
    }

    /// Number of failed attempts since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    #[cfg(test)]
    pub fn current_backoff(&self) -> Duration {
        self.current
    }
}
