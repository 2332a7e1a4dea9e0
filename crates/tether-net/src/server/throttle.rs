//! Accept failure burst throttling.

use tether_core::AcceptConfig;
use tokio::time::{Duration, Instant};

/// Counts recoverable accept failures inside a sliding burst window.
///
/// Reaching the threshold inside one window yields a cooldown, after which
/// counting starts over.
#[derive(Debug, Clone)]
pub struct AcceptThrottle {
    window: Duration,
    threshold: u32,
    cooldown: Duration,
    window_start: Option<Instant>,
    failures: u32,
}

impl AcceptThrottle {
    /// Creates a throttle.
    #[must_use]
    pub const fn new(window: Duration, threshold: u32, cooldown: Duration) -> Self {
        Self {
            window,
            threshold,
            cooldown,
            window_start: None,
            failures: 0,
        }
    }

    /// Creates a throttle from configuration.
    #[must_use]
    pub const fn from_config(config: &AcceptConfig) -> Self {
        Self::new(config.burst_window(), config.burst_threshold, config.cooldown())
    }

    /// Records a failure at `now`. Returns the pause to apply, if any.
    pub fn record_failure(&mut self, now: Instant) -> Option<Duration> {
        match self.window_start {
            Some(start) if now.saturating_duration_since(start) <= self.window => {
                self.failures += 1;
            },
            _ => {
                self.window_start = Some(now);
                self.failures = 1;
            },
        }
        if self.failures >= self.threshold {
            self.reset();
            return Some(self.cooldown);
        }
        None
    }

    /// Forgets all recorded failures.
    pub fn reset(&mut self) {
        self.window_start = None;
        self.failures = 0;
    }

    /// Failures counted in the current window.
    #[must_use]
    pub const fn failures(&self) -> u32 {
        self.failures
    }
}
