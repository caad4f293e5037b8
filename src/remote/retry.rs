//! Bounded exponential backoff for transient remote failures.

use std::time::Duration;

use rand::Rng;
use reqwest::StatusCode;

/// Retry behavior for a single request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Randomize each delay into `[delay/2, delay]`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts (tests).
    #[must_use]
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Delay before the next attempt, or `None` once `attempt` (1-based, the
    /// attempt that just failed) has used up the budget.
    #[must_use]
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let delay = calculate_backoff(attempt.saturating_sub(1), self.base_delay, self.max_delay);
        Some(if self.jitter { jittered(delay) } else { delay })
    }

    /// Delay to honour a server-provided `Retry-After`, capped by `max_delay`.
    #[must_use]
    pub fn clamp(&self, requested: Duration) -> Duration {
        requested.min(self.max_delay)
    }
}

/// `base * 2^attempt`, capped at `max`.
#[must_use]
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    base.saturating_mul(factor).min(max)
}

fn jittered(delay: Duration) -> Duration {
    let half = delay / 2;
    if half.is_zero() {
        return delay;
    }
    let span = u64::try_from(half.as_millis()).unwrap_or(u64::MAX);
    let extra = rand::thread_rng().gen_range(0..=span);
    half + Duration::from_millis(extra)
}

/// 5xx and 429 are worth another attempt; every other status is final.
#[must_use]
pub fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// Timeouts and connection failures are transient.
#[must_use]
pub fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect()
}
