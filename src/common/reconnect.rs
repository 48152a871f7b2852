//! Jittered backoff for reconnection.
//!
//! The delay for attempt `n` is drawn uniformly from
//! `[0.8 * upper, upper]` where `upper = min((n + 2) / 3, 2) * base`.
//! Growth stops at twice the base, so a client that has been offline for
//! hours retries no slower than one that has just dropped.

use std::time::Duration;

use backon::BackoffBuilder;
use rand::Rng;

/// Growth factor is capped at this multiple of the base timeout.
const MAX_FACTOR: f64 = 2.0;

/// Fraction of the upper bound that jitter may shave off.
const JITTER_RANGE: f64 = 0.2;

/// Pure retry-delay computation.
#[derive(Debug, Clone, Copy)]
pub struct BackoffStrategy;

impl BackoffStrategy {
    /// Multiplier applied to the base timeout for a 1-indexed attempt.
    pub fn factor(attempt: u32) -> f64 {
        ((attempt as f64 + 2.0) / 3.0).min(MAX_FACTOR)
    }

    /// Jittered delay for `attempt`, using the thread-local RNG.
    pub fn delay(base: Duration, attempt: u32) -> Duration {
        Self::delay_with_jitter(base, attempt, rand::thread_rng().gen::<f64>())
    }

    /// Deterministic form of [`BackoffStrategy::delay`]. `jitter` in `[0, 1]`
    /// selects a point in the jitter window: 0 yields the upper bound, 1 the
    /// lower bound.
    pub fn delay_with_jitter(base: Duration, attempt: u32, jitter: f64) -> Duration {
        let upper = scale(base, Self::factor(attempt));
        let jitter = jitter.clamp(0.0, 1.0);
        scale(upper, 1.0 - JITTER_RANGE * jitter)
    }
}

/// Multiplies a duration, rounding to the nearest nanosecond.
fn scale(duration: Duration, factor: f64) -> Duration {
    Duration::from_nanos((duration.as_nanos() as f64 * factor).round() as u64)
}

/// Builds an unbounded [`RetryBackoff`] iterator for a base timeout.
#[derive(Debug, Clone, Copy)]
pub struct RetryBackoffBuilder {
    base: Duration,
}

impl RetryBackoffBuilder {
    pub fn new(base: Duration) -> Self {
        Self { base }
    }
}

impl BackoffBuilder for RetryBackoffBuilder {
    type Backoff = RetryBackoff;

    fn build(self) -> Self::Backoff {
        RetryBackoff {
            base: self.base,
            attempt: 0,
        }
    }
}

/// Yields successive retry delays. Never exhausts; callers rebuild it after a
/// successful connection to start again from the first attempt.
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    base: Duration,
    attempt: u32,
}

impl RetryBackoff {
    /// Number of delays handed out so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

impl Iterator for RetryBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        self.attempt = self.attempt.saturating_add(1);
        Some(BackoffStrategy::delay(self.base, self.attempt))
    }
}
