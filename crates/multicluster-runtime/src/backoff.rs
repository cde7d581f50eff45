//! # Retry backoff policies
//!
//! A [`Backoff`] turns the number of consecutive failures of a queue key into
//! the delay before its next delivery. The per-key failure counter itself
//! lives in the work queue; policies here are stateless so they can be
//! tested without any timers.
//!
//! Two policies are provided:
//! - [`ExponentialBackoff`]: base, 2×base, 4×base, ... capped at max
//! - [`FibonacciBackoff`]: min, min, 2×min, 3×min, 5×min, ... capped at max,
//!   which grows more slowly than exponential backoff

use std::time::Duration;

/// Maps a failure count to a retry delay.
///
/// Implementations must be non-decreasing in `failures`.
pub trait Backoff: Send + Sync + std::fmt::Debug {
    /// Delay before the next attempt after `failures` previous failures
    /// (0 for the first retry).
    fn delay_for(&self, failures: u32) -> Duration;
}

/// Doubling backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    /// Create an exponential backoff starting at `base` and capped at `max`.
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }
}

impl Default for ExponentialBackoff {
    /// 5ms doubling up to 1000s.
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(1000))
    }
}

impl Backoff for ExponentialBackoff {
    fn delay_for(&self, failures: u32) -> Duration {
        // 2^31 already overflows any sane base, so clamp the exponent
        let factor = 1u32.checked_shl(failures.min(31)).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }
}

/// Fibonacci backoff calculator
///
/// The sequence starts at `min` for the first two failures, then each delay
/// is the sum of the previous two, capped at `max`.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    /// First (and second) delay
    min: Duration,
    /// Upper bound for every delay
    max: Duration,
}

impl FibonacciBackoff {
    /// Create a new Fibonacci backoff with the given minimum and maximum.
    ///
    /// With `min = 1s` and `max = 10s` the sequence is
    /// 1s, 1s, 2s, 3s, 5s, 8s, 10s, 10s, ...
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }
}

impl Backoff for FibonacciBackoff {
    fn delay_for(&self, failures: u32) -> Duration {
        if failures <= 1 || self.min.is_zero() {
            // First two values are both min
            return self.min.min(self.max);
        }

        let mut prev = self.min;
        let mut current = self.min;
        for _ in 2..=failures {
            let next = prev.saturating_add(current);
            prev = current;
            current = next.min(self.max);

            // If we've hit the max, we can stop early
            if current >= self.max {
                break;
            }
        }
        current
    }
}
