//! Bounded exponential backoff for polling loops
//!
//! Health checks and challenge probes poll an external process until it
//! reports ready. Polling is bounded twice: by a maximum number of attempts
//! and by a wall-clock deadline. Delays double from `initial_delay` up to
//! `max_delay` and are clamped so the total wait never exceeds the deadline.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::trace;

/// Backoff policy shared by every polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Maximum number of attempts (the first attempt counts)
    pub max_attempts: u32,
    /// Wall-clock budget for all attempts
    pub deadline: Duration,
    /// Delay after the first failed attempt
    pub initial_delay: Duration,
    /// Upper bound for a single delay
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            deadline: Duration::from_secs(60),
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn new(max_attempts: u32, deadline: Duration) -> Self {
        Self {
            max_attempts,
            deadline,
            ..Default::default()
        }
    }

    pub fn with_delays(mut self, initial_delay: Duration, max_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self.max_delay = max_delay.max(initial_delay);
        self
    }

    /// Policy that retries immediately; used by tests and dry-run paths
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            deadline: Duration::from_secs(5),
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Start tracking a new polling loop
    pub fn start(&self) -> Backoff {
        Backoff {
            policy: *self,
            attempts: 0,
            started: Instant::now(),
            scheduled: Duration::ZERO,
            current_delay: self.initial_delay,
        }
    }
}

/// State of one polling loop.
///
/// Call [`Backoff::record_attempt`] before every attempt and
/// [`Backoff::next_delay`] after every failed one; `None` means the loop is
/// exhausted.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempts: u32,
    started: Instant,
    /// Sum of delays handed out so far
    scheduled: Duration,
    current_delay: Duration,
}

impl Backoff {
    /// Register that an attempt is about to be made
    pub fn record_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    /// Attempts made so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Time since the loop started
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Budget consumed, counting both real time and delays already handed out
    fn consumed(&self) -> Duration {
        self.elapsed().max(self.scheduled)
    }

    /// Delay before the next attempt, or `None` when either bound is reached
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.policy.max_attempts {
            trace!(attempts = self.attempts, "Backoff exhausted by attempt count");
            return None;
        }

        let remaining = self.policy.deadline.checked_sub(self.consumed())?;
        if remaining.is_zero() {
            trace!(attempts = self.attempts, "Backoff exhausted by deadline");
            return None;
        }

        let delay = self.current_delay.min(remaining);
        self.scheduled += delay;
        self.current_delay = (self.current_delay * 2).min(self.policy.max_delay);
        Some(delay)
    }
}
