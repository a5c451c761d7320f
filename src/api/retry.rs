use std::time::Duration;

use rand::Rng;

use crate::api::errors::ApiError;

/// Explicit retry policy for outbound requests: capped exponential backoff
/// with jitter. Idempotent requests additionally retry on 5xx; nothing is
/// ever retried on a 4xx.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 8,
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `attempt + 1`, without jitter. Doubles from
    /// the base and saturates at the cap.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let raw = self
            .base
            .saturating_mul(2u32.saturating_pow(exp));
        raw.min(self.cap)
    }

    pub fn jittered(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        let jitter_ms = delay.as_millis() as u64 / 2;
        if jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    pub fn should_retry(&self, error: &ApiError, attempt: u32, idempotent: bool) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }
        match error {
            ApiError::Transport(_) => true,
            ApiError::Server(_) => idempotent,
            // The per-class budget decides how long to hold off.
            ApiError::RateLimited(_) => true,
            ApiError::Unauthorized
            | ApiError::NotFound
            | ApiError::Conflict
            | ApiError::Stalled
            | ApiError::Cancelled
            | ApiError::Protocol(_) => false,
        }
    }
}
