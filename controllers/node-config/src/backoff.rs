//! # Backoff
//!
//! Two retry schedules:
//!
//! - [`FibonacciBackoff`] spaces out requeues of a failing reconcile. It grows
//!   more slowly than exponential backoff, so a node that keeps failing is
//!   still retried often enough to notice when the cause clears.
//!   Sequence with the reconciler's settings: 1s, 1s, 2s, 3s, 5s, 8s, 13s, 21s, 30s (max).
//! - [`ExponentialBackoff`] paces the drainer's cordon retries, which block
//!   inside one call and must stay short.
//!
//! [`RequeueBackoff`] keeps one Fibonacci sequence per watched object.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Fibonacci backoff calculator
///
/// Each backoff is the sum of the previous two, capped at `max_seconds`.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    /// Minimum backoff value in seconds (for reset)
    min_seconds: u64,
    /// Previous backoff value in seconds
    prev_seconds: u64,
    /// Current backoff value in seconds
    current_seconds: u64,
    /// Maximum backoff value in seconds
    max_seconds: u64,
}

impl FibonacciBackoff {
    /// Create a new Fibonacci backoff with minimum and maximum values in seconds
    #[must_use]
    pub fn new(min_seconds: u64, max_seconds: u64) -> Self {
        Self {
            min_seconds,
            prev_seconds: 0,
            current_seconds: min_seconds,
            max_seconds,
        }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current_seconds;

        let next = self.prev_seconds + self.current_seconds;
        self.prev_seconds = self.current_seconds;
        self.current_seconds = std::cmp::min(next, self.max_seconds);

        Duration::from_secs(result)
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.prev_seconds = 0;
        self.current_seconds = self.min_seconds;
    }
}

/// Doubling backoff with a fixed number of attempts
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max_delay: Duration,
    max_attempts: u32,
}

impl ExponentialBackoff {
    /// `max_attempts` counts the first try, so `max_attempts - 1` delays are produced
    #[must_use]
    pub fn new(initial: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            max_delay,
            max_attempts,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to wait after failed attempt number `attempt` (1-based), or
    /// `None` when the attempts are used up
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        Some(std::cmp::min(self.initial.saturating_mul(factor), self.max_delay))
    }
}

/// Per-object Fibonacci backoff for failing reconciles
#[derive(Debug)]
pub struct RequeueBackoff {
    min_seconds: u64,
    max_seconds: u64,
    /// Object name -> backoff state
    states: Mutex<HashMap<String, FibonacciBackoff>>,
}

impl RequeueBackoff {
    #[must_use]
    pub fn new(min_seconds: u64, max_seconds: u64) -> Self {
        Self {
            min_seconds,
            max_seconds,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Delay before retrying `key` after another failure
    pub fn on_error(&self, key: &str) -> Duration {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states
            .entry(key.to_string())
            .or_insert_with(|| FibonacciBackoff::new(self.min_seconds, self.max_seconds))
            .next_backoff()
    }

    /// Forget the failures of `key`
    pub fn on_success(&self, key: &str) {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states.remove(key);
    }
}
