use rand::Rng;
use std::time::Duration;

/// Exponential backoff with additive jitter and a bounded number of attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    /// Largest exponent applied to `base`.
    pub cap: u32,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(2000),
            cap: 6,
            max_attempts: 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    Exhausted,
}

impl RetryPolicy {
    pub fn new(base: Duration, cap: u32, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
        }
    }

    /// `base * 2^min(attempt_count, cap)` plus a jitter drawn from `[0, base)`.
    pub fn next_attempt(&self, attempt_count: u32) -> Duration {
        self.next_attempt_with(attempt_count, &mut rand::thread_rng())
    }

    pub fn next_attempt_with<R: Rng + ?Sized>(&self, attempt_count: u32, rng: &mut R) -> Duration {
        let exponent = attempt_count.min(self.cap).min(31);
        let delay = self.base.saturating_mul(1u32 << exponent);

        let base_ms = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        if base_ms == 0 {
            return delay;
        }
        let jitter = Duration::from_millis(rng.gen_range(0..base_ms));
        delay.saturating_add(jitter)
    }

    /// What to do after `attempt_count` attempts have failed transiently.
    pub fn decide(&self, attempt_count: u32) -> RetryDecision {
        if attempt_count >= self.max_attempts {
            RetryDecision::Exhausted
        } else {
            RetryDecision::RetryAfter(self.next_attempt(attempt_count))
        }
    }
}
