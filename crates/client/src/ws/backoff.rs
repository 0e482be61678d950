//! Reconnect delay computation.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with a ceiling and additive jitter.
///
/// Pre-jitter delay for attempt `a` is `max(base, min(max, base * 2^a))`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    /// Jitter is drawn uniformly from `[0, jitter)`.
    pub jitter: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter: Duration::from_secs(1),
        }
    }
}

impl Backoff {
    /// Delay for a given attempt number, before jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = 2u32
            .checked_pow(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .unwrap_or(self.max);
        scaled.min(self.max).max(self.base)
    }

    /// A random jitter in `[0, jitter)`, at millisecond resolution.
    pub fn jitter(&self) -> Duration {
        let window = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        if window == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..window))
    }

    /// Full delay to wait before the next attempt.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        self.delay_for_attempt(attempt) + self.jitter()
    }
}
