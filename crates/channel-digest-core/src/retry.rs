//! Exponential backoff for enrichment retries.

use chrono::{DateTime, Duration, Utc};

/// Retry envelope for failed enrichments.
///
/// After the k-th failure the next attempt is scheduled at
/// `now + min(base · 2^(k−1), max_backoff)`. Once `retry_count` reaches
/// `max_retries` the item is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_backoff: Duration::minutes(1),
            max_backoff: Duration::hours(6),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, given the failures recorded so far.
    pub fn backoff_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(30);
        let factor = 1i64 << exponent;
        let base_secs = self.base_backoff.num_seconds().max(0);
        let delay = Duration::seconds(base_secs.saturating_mul(factor));
        delay.min(self.max_backoff)
    }

    pub fn next_retry_at(&self, retry_count: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.backoff_for(retry_count)
    }

    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let p = RetryPolicy::default();
        assert_eq!(p.backoff_for(1), Duration::minutes(1));
        assert_eq!(p.backoff_for(2), Duration::minutes(2));
        assert_eq!(p.backoff_for(3), Duration::minutes(4));
        assert_eq!(p.backoff_for(4), Duration::minutes(8));
    }

    #[test]
    fn test_backoff_capped() {
        let p = RetryPolicy {
            max_retries: 50,
            base_backoff: Duration::minutes(1),
            max_backoff: Duration::minutes(30),
        };
        assert_eq!(p.backoff_for(10), Duration::minutes(30));
        assert_eq!(p.backoff_for(40), Duration::minutes(30));
    }

    #[test]
    fn test_exhaustion() {
        let p = RetryPolicy::default();
        assert!(!p.is_exhausted(4));
        assert!(p.is_exhausted(5));
    }
}
