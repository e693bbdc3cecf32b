//! Exponential backoff reconnection logic.

use std::time::Duration;

/// Configuration for exponential backoff reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt, and after any successful connect.
    pub min_delay: Duration,
    /// Maximum delay between reconnection attempts.
    pub max_delay: Duration,
    /// Multiplier for each successive attempt.
    pub growth_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            growth_factor: 1.5,
        }
    }
}

/// Next delay after `delay`: `min(delay * growth, max)`.
///
/// Computed in whole milliseconds, truncating.
pub fn next_delay(delay: Duration, growth: f64, max: Duration) -> Duration {
    let grown = (delay.as_millis() as f64 * growth) as u64;
    Duration::from_millis(grown).min(max)
}

/// Tracks reconnection state and calculates delays.
#[derive(Debug)]
pub struct ReconnectState {
    config: ReconnectConfig,
    failures: u32,
    current_delay: Duration,
}

impl ReconnectState {
    pub fn new(config: ReconnectConfig) -> Self {
        let current_delay = config.min_delay;
        Self {
            config,
            failures: 0,
            current_delay,
        }
    }

    /// Returns the delay to wait now and grows the delay for next time.
    pub fn advance(&mut self) -> Duration {
        let delay = self.current_delay;
        self.failures += 1;
        self.current_delay = next_delay(
            self.current_delay,
            self.config.growth_factor,
            self.config.max_delay,
        );
        delay
    }

    /// Reset state after successful connection.
    pub fn reset(&mut self) {
        self.failures = 0;
        self.current_delay = self.config.min_delay;
    }

    /// Delay that the next [`advance`](Self::advance) will return.
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    /// Number of waits since the last successful connect.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}
