// Retry policies
// - BackoffPolicy: delay between attempts of one external call
// - AttemptPolicy: whether a reclaimed job may run again at all
use crate::domain::Job;
use rand::Rng;
use std::time::Duration;
use tracing::warn;

/// Default base delay for the first retry (1s)
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default ceiling for any single backoff wait (60s)
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Exponential backoff with additive jitter
///
/// delay(attempt) = min(base * 2^attempt + jitter, max_delay), jitter uniform in [0, max_jitter).
/// With max_jitter <= base the sequence is strictly increasing until it reaches the cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_jitter: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_jitter: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl BackoffPolicy {
    /// Jitter is clamped to the base delay
    pub fn new(base_delay: Duration, max_jitter: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_jitter: max_jitter.min(base_delay),
            max_delay,
        }
    }

    /// Wait before retry number `attempt` (0-based).
    /// A server-supplied Retry-After replaces the computed value; both are capped.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(server_delay) = retry_after {
            return server_delay.min(self.max_delay);
        }

        let exponential = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(31)));
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
        };

        exponential.saturating_add(jitter).min(self.max_delay)
    }
}

/// Dead-letter hook consulted right after a successful claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttemptPolicy {
    /// Reclaim forever (lease expiry is the only bound)
    #[default]
    Unbounded,
    /// Fail the job with MAX_ATTEMPTS_EXCEEDED once `attempts` exceeds this
    MaxAttempts(u32),
}

impl AttemptPolicy {
    pub fn from_limit(limit: Option<u32>) -> Self {
        match limit {
            Some(n) => AttemptPolicy::MaxAttempts(n),
            None => AttemptPolicy::Unbounded,
        }
    }

    /// `job.attempts` already counts the claim that is being checked
    pub fn is_exhausted(&self, job: &Job) -> bool {
        match self {
            AttemptPolicy::Unbounded => false,
            AttemptPolicy::MaxAttempts(max) => {
                if job.attempts > *max {
                    warn!(
                        job_id = %job.id,
                        attempts = job.attempts,
                        max_attempts = max,
                        "Max attempts exceeded"
                    );
                    true
                } else {
                    false
                }
            }
        }
    }
}
