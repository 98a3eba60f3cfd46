//! Exponential retry backoff.

use rand::Rng;
use std::time::Duration;

/// Bounded exponential backoff with equal jitter.
///
/// The nominal delay for attempt `n` (1-based) is
/// `min(base * multiplier^(n-1), max)`. With jitter enabled, half of that
/// delay is fixed and the other half is drawn uniformly, so consecutive
/// retries from many workers spread out without ever dropping below half the
/// nominal value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    multiplier: u32,
    max: Duration,
    jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), 2, Duration::from_secs(600))
    }
}

impl BackoffPolicy {
    /// Creates a jittered policy. A multiplier below 1 is treated as 1 and a
    /// `max` below `base` is raised to `base`.
    #[must_use]
    pub fn new(base: Duration, multiplier: u32, max: Duration) -> Self {
        Self {
            base,
            multiplier: multiplier.max(1),
            max: max.max(base),
            jitter: true,
        }
    }

    /// Disables jitter so delays equal the nominal value.
    #[must_use]
    pub const fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Returns the first-retry delay.
    #[must_use]
    pub const fn base(&self) -> Duration {
        self.base
    }

    /// Returns the growth factor.
    #[must_use]
    pub const fn multiplier(&self) -> u32 {
        self.multiplier
    }

    /// Returns the delay cap.
    #[must_use]
    pub const fn max(&self) -> Duration {
        self.max
    }

    /// Returns the un-jittered delay after the `attempt`-th failure.
    ///
    /// Attempt `0` is treated as the first failure.
    #[must_use]
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let base_ms = duration_ms(self.base);
        let max_ms = duration_ms(self.max);
        let factor = u64::from(self.multiplier)
            .checked_pow(exponent)
            .unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
    }

    /// Returns the delay to apply after the `attempt`-th failure.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    /// Same as [`delay`](Self::delay) with an explicit random source.
    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if !self.jitter {
            return nominal;
        }
        let nominal_ms = duration_ms(nominal);
        let half = nominal_ms >> 1;
        let spread = nominal_ms - half;
        Duration::from_millis(half + rng.gen_range(0..=spread))
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
