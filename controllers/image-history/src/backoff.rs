//! # Fibonacci Backoff
//!
//! Progressive backoff for retries that grows more slowly than exponential
//! backoff. Used both for restarting the pod watch after source failures and
//! for retrying failed store writes.
//!
//! With a 1s base and a 30s cap the watch restart sequence is:
//! 1s, 1s, 2s, 3s, 5s, 8s, 13s, 21s, 30s (max).

use std::time::Duration;

/// Fibonacci backoff calculator
///
/// Each delay is the sum of the previous two, starting from `min` twice and
/// capped at `max`.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    min: Duration,
    prev: Duration,
    current: Duration,
    max: Duration,
}

impl FibonacciBackoff {
    /// Create a new Fibonacci backoff with the given base and cap.
    ///
    /// # Arguments
    ///
    /// * `min` - First (and second) delay in the sequence
    /// * `max` - Upper bound on any returned delay
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            prev: Duration::ZERO,
            current: min,
            max,
        }
    }

    /// Backoff used when the pod watch has to be restarted: 1s up to 30s.
    #[must_use]
    pub fn for_watch() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }

    /// Backoff used between store write attempts: 100ms up to 2s.
    #[must_use]
    pub fn for_store_writes() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(2))
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current;

        let next = self.prev.saturating_add(self.current);
        self.prev = self.current;
        self.current = std::cmp::min(next, self.max);

        result
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.prev = Duration::ZERO;
        self.current = self.min;
    }
}
