//! Reconnect pacing
//!
//! Exponential backoff with a cap for the supervisor's reconnect loop,
//! plus a counter that surfaces protocol errors once they stop looking
//! transient.

use std::time::Duration;

/// Exponential backoff: `base * 2^attempt`, capped.
#[derive(Debug)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    pub fn next_backoff(&mut self) -> Duration {
        let backoff = self.base.saturating_mul(2u32.saturating_pow(self.attempt));
        self.attempt = self.attempt.saturating_add(1);
        backoff.min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Counts consecutive protocol failures; past the threshold the
/// supervisor stops retrying and surfaces the error.
#[derive(Debug)]
pub struct ProtocolFailureTracker {
    consecutive: u32,
    threshold: u32,
}

impl ProtocolFailureTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive: 0,
            threshold,
        }
    }

    /// Record a protocol failure; returns true when the threshold is hit.
    pub fn record(&mut self) -> bool {
        self.consecutive = self.consecutive.saturating_add(1);
        self.consecutive >= self.threshold
    }

    /// Anything other than a protocol failure resets the streak.
    pub fn reset(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}
