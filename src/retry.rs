use std::time::Duration;

use rand::Rng;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(300);
pub const DEFAULT_JITTER_RATIO: f64 = 0.2;

/// Backoff schedule applied by workers when a handler fails.
///
/// `next_delay(attempt)` is `min(base * 2^attempt, max_delay)` plus up to
/// `jitter_ratio` of that delay in random jitter, never exceeding `max_delay`.
/// The policy holds no per-job state.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_ratio: f64,
    pub default_max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter_ratio: DEFAULT_JITTER_RATIO,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// The same delay after every failure.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            jitter_ratio: 0.0,
            ..Self::default()
        }
    }

    pub fn no_jitter(mut self) -> Self {
        self.jitter_ratio = 0.0;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts.max(1);
        self
    }

    /// Delay before the job may run again, given how many attempts already failed
    /// before this one (`attempt` as stored on the job when it was claimed).
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let delay = self.backoff(attempt);
        if self.jitter_ratio <= 0.0 || delay.is_zero() {
            return delay;
        }
        let max_jitter = delay.as_secs_f64() * self.jitter_ratio.min(1.0);
        let jitter = rand::rng().random_range(0.0..=max_jitter);
        (delay + Duration::from_secs_f64(jitter)).min(self.max_delay)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn max_attempts_or_default(&self, max_attempts: Option<u32>) -> u32 {
        max_attempts.unwrap_or(self.default_max_attempts).max(1)
    }
}
