//! Backoff schedules.
//!
//! [`ResurrectBackoff`] decides how long a dead connection stays out of rotation;
//! [`RetryBackoff`] is the optional pause between attempts of one logical request.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Quarantine schedule for dead connections.
///
/// The delay after the `n`th consecutive failure is
/// `base * 2^min(n - 1, cutoff)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResurrectBackoff {
    /// Delay after the first failure (default: 60 seconds).
    pub base: Duration,
    /// Highest exponent applied (default: 5).
    pub cutoff: u32,
    /// Absolute ceiling (default: 1 hour).
    pub max: Duration,
}

impl Default for ResurrectBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(60),
            cutoff: 5,
            max: Duration::from_secs(3600),
        }
    }
}

impl ResurrectBackoff {
    /// Delay before a connection with `dead_count` consecutive failures may be retried.
    pub fn delay(&self, dead_count: u32) -> Duration {
        let exponent = dead_count.saturating_sub(1).min(self.cutoff).min(31);
        let factor = 1u32 << exponent;
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Configuration for the pause between retries of a logical request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryBackoff {
    /// Initial backoff in milliseconds; 0 disables the pause (default: 0).
    pub initial_backoff_ms: u64,
    /// Maximum backoff in milliseconds (default: 2000).
    pub max_backoff_ms: u64,
    /// Multiplier for exponential backoff (default: 2.0).
    pub backoff_multiplier: f64,
    /// Whether to add random jitter up to 50% of the delay (default: true).
    pub jitter: bool,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 0,
            max_backoff_ms: 2000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryBackoff {
    /// Pause before retry number `retry` (0-based).
    pub fn delay(&self, retry: u32) -> Duration {
        if self.initial_backoff_ms == 0 {
            return Duration::ZERO;
        }
        let base_ms = self.initial_backoff_ms as f64;
        let computed = base_ms * self.backoff_multiplier.max(1.0).powi(retry.min(63) as i32);
        let capped = computed.min(self.max_backoff_ms as f64) as u64;

        if self.jitter && capped > 1 {
            let jitter_ms = rand::thread_rng().gen_range(0..=capped / 2);
            Duration::from_millis(capped.saturating_add(jitter_ms))
        } else {
            Duration::from_millis(capped)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resurrect_backoff_defaults() {
        let backoff = ResurrectBackoff::default();
        assert_eq!(backoff.delay(1), Duration::from_secs(60));
        assert_eq!(backoff.delay(2), Duration::from_secs(120));
        assert_eq!(backoff.delay(3), Duration::from_secs(240));
        assert_eq!(backoff.delay(6), Duration::from_secs(1920));
        // cutoff reached
        assert_eq!(backoff.delay(50), Duration::from_secs(1920));
    }

    #[test]
    fn test_resurrect_backoff_ceiling() {
        let backoff = ResurrectBackoff {
            base: Duration::from_secs(60),
            cutoff: 10,
            max: Duration::from_secs(3600),
        };
        assert_eq!(backoff.delay(7), Duration::from_secs(3600));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(3600));
    }

    #[test]
    fn test_resurrect_backoff_zero_count() {
        let backoff = ResurrectBackoff::default();
        assert_eq!(backoff.delay(0), Duration::from_secs(60));
    }

    #[test]
    fn test_retry_backoff_disabled_by_default() {
        let backoff = RetryBackoff::default();
        assert_eq!(backoff.delay(0), Duration::ZERO);
        assert_eq!(backoff.delay(5), Duration::ZERO);
    }

    #[test]
    fn test_retry_backoff_exponential() {
        let backoff = RetryBackoff {
            initial_backoff_ms: 100,
            max_backoff_ms: 500,
            backoff_multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(2), Duration::from_millis(400));
        assert_eq!(backoff.delay(3), Duration::from_millis(500));
    }

    #[test]
    fn test_retry_backoff_jitter_bounds() {
        let backoff = RetryBackoff {
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
            backoff_multiplier: 2.0,
            jitter: true,
        };
        for _ in 0..50 {
            let delay = backoff.delay(0);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }
}
