//! Exponential backoff for retryable step failures.

use chrono::{DateTime, Duration, Utc};

use crate::config::RetryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub multiplier: u32,
    pub max: Duration,
}

/// What to do with an action after a retryable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAt(DateTime<Utc>),
    /// Attempt budget or retry window exhausted.
    GiveUp,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            base: secs(cfg.backoff_base_secs),
            multiplier: cfg.backoff_multiplier,
            max: secs(cfg.backoff_max_secs),
        }
    }

    /// Delay before attempt `attempt + 1`: `base * multiplier^(attempt-1)`,
    /// capped at `max`. Attempt 0 is treated as 1.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let factor = i64::from(self.multiplier.max(1))
            .checked_pow(exp)
            .unwrap_or(i64::MAX);
        let delay = self
            .base
            .num_seconds()
            .saturating_mul(factor)
            .min(self.max.num_seconds());
        Duration::seconds(delay)
    }

    /// Decide the fate of an action whose `attempt_count` is already
    /// incremented to `attempts`.
    pub fn decide(
        &self,
        attempts: u32,
        retry_until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        if attempts >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        if retry_until.is_some_and(|deadline| now >= deadline) {
            return RetryDecision::GiveUp;
        }
        RetryDecision::RetryAt(now + self.backoff(attempts))
    }
}

// Ten years; keeps chrono arithmetic in range for absurd configs.
const MAX_DELAY_SECS: u64 = 10 * 365 * 24 * 3600;

fn secs(value: u64) -> Duration {
    Duration::seconds(value.min(MAX_DELAY_SECS) as i64)
}
