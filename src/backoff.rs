//! Reconnect backoff.
//!
//! [`Backoff`] turns a [`BackoffConfig`] into the sequence of delays the
//! supervisor sleeps between reconnect attempts:
//!
//! - First delay: `initial_delay` (with jitter)
//! - Subsequent delays: `min(previous * multiplier, max_delay)` (with jitter)
//! - Jitter: ±25% randomization so clients that lost the same broker do not
//!   reconnect in lockstep
//!
//! There is no attempt limit; the supervisor keeps going until it connects
//! or is closed.

use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::time::Duration;

use crate::BackoffConfig;

/// Stateful delay generator for one reconnect episode.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    config: BackoffConfig,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub(crate) fn new(config: &BackoffConfig) -> Self {
        Self {
            config: config.clone(),
            current: config.initial_delay,
            attempts: 0,
        }
    }

    /// Number of delays handed out so far.
    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay to wait before the next attempt.
    pub(crate) fn next_delay(&mut self) -> Duration {
        // ---
        let delay = apply_jitter(self.current).min(self.config.max_delay);
        self.attempts = self.attempts.saturating_add(1);

        let next =
            Duration::from_secs_f64(self.current.as_secs_f64() * self.config.multiplier as f64);
        self.current = next.min(self.config.max_delay);

        delay
    }
}

/// Apply ±25% jitter to a duration.
///
/// Uses a simple multiplicative jitter: `delay * (0.75 + random(0.0..0.5))`
fn apply_jitter(delay: Duration) -> Duration {
    // ---
    let random_state = RandomState::new();
    let hash = random_state.hash_one(std::time::SystemTime::now());

    let random_factor = (hash % 1000) as f64 / 1000.0;
    let jitter_multiplier = 0.75 + (random_factor * 0.5);

    Duration::from_secs_f64(delay.as_secs_f64() * jitter_multiplier)
}
