//! Per-key exponential backoff
//!
//! Each key carries its own failure count. The delay for the n-th consecutive
//! failure (0-based) is `base * 2^n`, capped at `max`. `forget` resets a key.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default first retry delay
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Default backoff ceiling
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Backoff bounds, as read from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY.as_millis() as u64,
            max_delay_ms: DEFAULT_MAX_DELAY.as_millis() as u64,
        }
    }
}

impl BackoffConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Exponential per-item failure rate limiter
#[derive(Debug)]
pub struct ExponentialBackoff<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K: Eq + Hash + Clone> ExponentialBackoff<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.base_delay(), config.max_delay())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, u32>> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a failure for `key` and return how long to wait before retrying
    pub fn when(&self, key: &K) -> Duration {
        let exp = {
            let mut failures = self.lock();
            let count = failures.entry(key.clone()).or_insert(0);
            let exp = *count;
            *count = count.saturating_add(1);
            exp
        };
        self.delay_for(exp)
    }

    /// Delay for the given 0-based failure number, without recording anything
    pub fn delay_for(&self, failures: u32) -> Duration {
        let scaled = 1u128
            .checked_shl(failures)
            .and_then(|factor| self.base.as_nanos().checked_mul(factor))
            .filter(|nanos| *nanos < self.max.as_nanos())
            .and_then(|nanos| u64::try_from(nanos).ok());

        match scaled {
            Some(nanos) => Duration::from_nanos(nanos),
            None => self.max,
        }
    }

    /// Number of failures recorded for `key` since the last `forget`
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.lock().get(key).copied().unwrap_or(0)
    }

    pub fn forget(&self, key: &K) {
        self.lock().remove(key);
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}

impl<K: Eq + Hash + Clone> Default for ExponentialBackoff<K> {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_per_failure() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(1));

        assert_eq!(backoff.when(&"a"), Duration::from_millis(10));
        assert_eq!(backoff.when(&"a"), Duration::from_millis(20));
        assert_eq!(backoff.when(&"a"), Duration::from_millis(40));
        assert_eq!(backoff.num_requeues(&"a"), 3);
    }

    #[test]
    fn test_delay_is_capped() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(10), Duration::from_millis(50));

        for _ in 0..3 {
            backoff.when(&"a");
        }
        assert_eq!(backoff.when(&"a"), Duration::from_millis(50));
        assert_eq!(backoff.delay_for(u32::MAX), Duration::from_millis(50));
    }

    #[test]
    fn test_keys_are_independent() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(1));

        backoff.when(&"a");
        backoff.when(&"a");
        assert_eq!(backoff.when(&"b"), Duration::from_millis(10));
    }

    #[test]
    fn test_forget_resets() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(1));

        backoff.when(&"a");
        backoff.when(&"a");
        backoff.forget(&"a");

        assert_eq!(backoff.num_requeues(&"a"), 0);
        assert_eq!(backoff.when(&"a"), Duration::from_millis(10));
    }

    #[test]
    fn test_config_defaults() {
        let config = BackoffConfig::default();
        assert_eq!(config.base_delay(), DEFAULT_BASE_DELAY);
        assert_eq!(config.max_delay(), DEFAULT_MAX_DELAY);
    }
}
