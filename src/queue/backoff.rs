use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy for failed pending operations.
///
/// Recognized config keys: `maxRetries`, `backoffBase`, `backoffCap` (milliseconds).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// `None` retries forever
    #[serde(default, alias = "max_retries")]
    pub max_retries: Option<u32>,
    #[serde(default = "default_backoff_base", alias = "backoff_base")]
    pub backoff_base: u64,
    #[serde(default = "default_backoff_cap", alias = "backoff_cap")]
    pub backoff_cap: u64,
}

fn default_backoff_base() -> u64 {
    10_000
}

fn default_backoff_cap() -> u64 {
    30 * 60 * 1000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: None,
            backoff_base: default_backoff_base(),
            backoff_cap: default_backoff_cap(),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after `retry_count` failures (1-based).
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let exponent = (retry_count - 1).min(32);
        let delay = self.backoff_base.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.backoff_cap))
    }

    /// Whether another attempt is allowed after `retry_count` failures.
    pub fn allows_retry(&self, retry_count: u32) -> bool {
        match self.max_retries {
            Some(max) => retry_count < max,
            None => true,
        }
    }

    /// Unix millis at which an item that failed `retry_count` times becomes due.
    pub fn next_attempt_at(&self, now_millis: i64, retry_count: u32) -> i64 {
        let delay = i64::try_from(self.delay_for(retry_count).as_millis()).unwrap_or(i64::MAX);
        now_millis.saturating_add(delay)
    }
}
