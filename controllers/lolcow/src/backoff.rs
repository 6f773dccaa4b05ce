//! # Fibonacci Backoff
//!
//! Progressive retry delays for transient reconcile failures. The sequence
//! grows more slowly than exponential backoff, so a briefly unavailable API
//! server is retried soon while a persistent outage settles at the cap.
//!
//! Sequence with the default bounds: 5s, 5s, 10s, 15s, 25s, 40s, ... 300s (max).

use resource_store::ObjectKey;
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
    /// Create a new Fibonacci backoff with the given bounds in seconds
    ///
    /// # Arguments
    ///
    /// * `min_seconds` - Used for the first two values
    /// * `max_seconds` - Caps the sequence
    #[must_use]
    pub fn new(min_seconds: u64, max_seconds: u64) -> Self {
        Self {
            min_seconds,
            prev_seconds: 0,
            current_seconds: min_seconds,
            max_seconds,
        }
    }

    /// Get the next backoff duration in seconds and advance the sequence
    pub fn next_backoff_seconds(&mut self) -> u64 {
        let result = self.current_seconds;

        let next = self.prev_seconds.saturating_add(self.current_seconds);
        self.prev_seconds = self.current_seconds;
        self.current_seconds = std::cmp::min(next, self.max_seconds);

        result
    }

    /// Get the next backoff duration as a `Duration` and advance the sequence
    #[must_use]
    pub fn next_backoff(&mut self) -> Duration {
        Duration::from_secs(self.next_backoff_seconds())
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.prev_seconds = 0;
        self.current_seconds = self.min_seconds;
    }
}

/// Backoff state for a single Lolcow
#[derive(Debug, Clone)]
struct BackoffState {
    backoff: FibonacciBackoff,
    error_count: u32,
}

/// Per-key backoff tracking.
///
/// Failures of one Lolcow never slow down retries of another. A successful
/// reconcile resets the key's sequence.
#[derive(Debug)]
pub struct BackoffRegistry {
    min: Duration,
    max: Duration,
    states: Mutex<HashMap<ObjectKey, BackoffState>>,
}

impl BackoffRegistry {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Records a failure for `key` and returns how long to wait before retrying
    pub fn next(&self, key: &ObjectKey) -> Duration {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let state = states.entry(key.clone()).or_insert_with(|| BackoffState {
            backoff: FibonacciBackoff::new(self.min.as_secs(), self.max.as_secs()),
            error_count: 0,
        });
        state.error_count += 1;
        state.backoff.next_backoff()
    }

    /// Forgets the failure history of `key`
    pub fn reset(&self, key: &ObjectKey) {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut state) = states.remove(key) {
            state.backoff.reset();
        }
    }

    /// Consecutive failures recorded for `key`
    pub fn error_count(&self, key: &ObjectKey) -> u32 {
        let states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states.get(key).map(|s| s.error_count).unwrap_or(0)
    }
}
