//! Backoff and per-key rate limiting.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

/// Default delay for the first retry of a key.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(5);

/// Default ceiling for per-key retry delays.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(1000);

/// Exponential backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            max: DEFAULT_BACKOFF_MAX,
            jitter: 0.0,
        }
    }
}

impl BackoffPolicy {
    /// Calculate delay for the given attempt number (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let max = self.max.as_nanos();
        let delay = self
            .base
            .as_nanos()
            .checked_mul(1u128 << attempt.min(64))
            .map_or(max, |d| d.min(max));
        let delay = nanos_to_duration(delay, self.max);

        if self.jitter <= 0.0 {
            return delay;
        }

        let factor: f64 = rand::random::<f64>() * 2.0 - 1.0;
        let jittered = delay.as_secs_f64() * (1.0 + self.jitter.min(1.0) * factor);
        Duration::from_secs_f64(jittered.clamp(0.0, self.max.as_secs_f64()))
    }
}

fn nanos_to_duration(nanos: u128, fallback: Duration) -> Duration {
    u64::try_from(nanos)
        .map(Duration::from_nanos)
        .unwrap_or(fallback)
}

/// Per-key failure counter feeding a [`BackoffPolicy`].
///
/// There is no retry limit: a key keeps failing with the capped delay until
/// it is forgotten.
#[derive(Debug, Clone)]
pub struct RateLimiter<K> {
    policy: BackoffPolicy,
    failures: HashMap<K, u32>,
}

impl<K: Eq + Hash + Clone> RateLimiter<K> {
    /// Create a new rate limiter.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            failures: HashMap::new(),
        }
    }

    /// Record a failure for `key` and return how long to wait before retrying it.
    pub fn when(&mut self, key: &K) -> Duration {
        let count = self.failures.entry(key.clone()).or_insert(0);
        let delay = self.policy.delay(*count);
        *count = count.saturating_add(1);
        delay
    }

    /// Clear failure tracking for a key (on success).
    pub fn forget(&mut self, key: &K) {
        self.failures.remove(key);
    }

    /// Number of times `key` has been re-queued since it was last forgotten.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }
}

impl<K: Eq + Hash + Clone> Default for RateLimiter<K> {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_policy() {
        let policy = BackoffPolicy::default();

        assert_eq!(policy.delay(0), Duration::from_millis(5));
        assert_eq!(policy.delay(1), Duration::from_millis(10));
        assert_eq!(policy.delay(2), Duration::from_millis(20));
    }

    #[test]
    fn test_backoff_max() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(1),
            max: Duration::from_secs(5),
            jitter: 0.0,
        };

        assert_eq!(policy.delay(10), Duration::from_secs(5));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_jitter_stays_under_ceiling() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
            jitter: 0.5,
        };

        for attempt in 0..20 {
            assert!(policy.delay(attempt) <= Duration::from_secs(1));
        }
    }

    #[test]
    fn test_rate_limiter_counts_per_key() {
        let mut limiter = RateLimiter::default();

        assert_eq!(limiter.when(&"a"), Duration::from_millis(5));
        assert_eq!(limiter.when(&"a"), Duration::from_millis(10));
        assert_eq!(limiter.when(&"b"), Duration::from_millis(5));
        assert_eq!(limiter.num_requeues(&"a"), 2);

        limiter.forget(&"a");
        assert_eq!(limiter.num_requeues(&"a"), 0);
        assert_eq!(limiter.when(&"a"), Duration::from_millis(5));
        assert_eq!(limiter.num_requeues(&"b"), 1);
    }
}
