//! Retry policy for long-lived subscribers.

use std::time::Duration;

use crate::config::{BackoffKind, Config};

/// Jitter applied to exponential delays (±20%).
const BACKOFF_JITTER_PERCENT: f64 = 0.2;

/// Floor for jittered exponential delays.
const MIN_RETRY_DELAY_MS: u64 = 100;

/// Generate a random jitter value between 0.0 and 1.0.
pub fn rand_jitter() -> f64 {
    use rand::Rng;
    rand::rng().random::<f64>()
}

/// How long to wait between consecutive failed attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Same delay after every failure
    Fixed(Duration),
    /// `base * 2^(n-1)`, capped at `max`, optionally jittered
    Exponential {
        base: Duration,
        max: Duration,
        jitter: bool,
    },
}

impl Backoff {
    /// Delay after the `failures`-th consecutive failure (1-based).
    pub fn delay(&self, failures: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max, jitter } => {
                let base_ms = base.as_millis() as u64;
                let max_ms = max.as_millis() as u64;
                let exponent = failures.saturating_sub(1).min(32);
                let delay_ms = base_ms.saturating_mul(2u64.saturating_pow(exponent)).min(max_ms);

                if !jitter {
                    return Duration::from_millis(delay_ms);
                }

                let offset =
                    (delay_ms as f64 * BACKOFF_JITTER_PERCENT * (rand_jitter() * 2.0 - 1.0)) as i64;
                let jittered = (delay_ms as i64)
                    .saturating_add(offset)
                    .max(MIN_RETRY_DELAY_MS as i64) as u64;
                Duration::from_millis(jittered)
            }
        }
    }
}

/// Bounded number of consecutive attempts plus the wait between them.
///
/// ```text
/// attempt 1 ─fail─► wait delay(1) ─► attempt 2 ─fail─► ... ─► attempt N ─fail─► give up
/// ```
///
/// There is no wait after the last failure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed(delay),
        }
    }

    pub fn exponential(max_attempts: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential {
                base,
                max,
                jitter: true,
            },
        }
    }

    pub fn from_config(config: &Config) -> Self {
        match config.consumer_backoff {
            BackoffKind::Fixed => {
                Self::fixed(config.consumer_max_attempts, config.consumer_retry_delay)
            }
            BackoffKind::Exponential => Self::exponential(
                config.consumer_max_attempts,
                config.consumer_retry_delay,
                config.consumer_retry_max_delay,
            ),
        }
    }

    /// Whether `failures` consecutive failures use up the budget.
    pub fn is_exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }

    /// Wait before the next attempt, or `None` when the budget is spent.
    pub fn delay_after(&self, failures: u32) -> Option<Duration> {
        if self.is_exhausted(failures) {
            None
        } else {
            Some(self.backoff.delay(failures))
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(5, Duration::from_secs(2))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_is_five_fixed_attempts() {
        let policy = RetryPolicy::default();

        for failures in 1..5 {
            assert_eq!(policy.delay_after(failures), Some(Duration::from_secs(2)));
        }
        assert_eq!(policy.delay_after(5), None);
        assert!(policy.is_exhausted(5));
        assert!(!policy.is_exhausted(4));
    }

    #[test]
    fn test_exponential_without_jitter_doubles_and_caps() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(500),
            max: Duration::from_secs(3),
            jitter: false,
        };

        assert_eq!(backoff.delay(1), Duration::from_millis(500));
        assert_eq!(backoff.delay(2), Duration::from_millis(1000));
        assert_eq!(backoff.delay(3), Duration::from_millis(2000));
        assert_eq!(backoff.delay(4), Duration::from_secs(3));
        assert_eq!(backoff.delay(60), Duration::from_secs(3));
    }

    #[test]
    fn test_exponential_jitter_stays_in_band() {
        let backoff = Backoff::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(10),
            jitter: true,
        };

        for _ in 0..100 {
            let delay = backoff.delay(2).as_millis();
            assert!((1600..=2400).contains(&delay), "delay {delay} out of band");
        }
    }

    #[test]
    fn test_jitter_respects_floor() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(10),
            max: Duration::from_millis(10),
            jitter: true,
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(MIN_RETRY_DELAY_MS));
    }

    #[test]
    fn test_from_config() {
        let config = Config {
            consumer_max_attempts: 3,
            consumer_backoff: BackoffKind::Exponential,
            ..Config::default()
        };
        let policy = RetryPolicy::from_config(&config);

        assert_eq!(policy.max_attempts, 3);
        assert!(matches!(policy.backoff, Backoff::Exponential { .. }));
        assert_eq!(
            RetryPolicy::from_config(&Config::default()),
            RetryPolicy::default()
        );
    }

    #[test]
    fn test_rand_jitter_returns_value_in_range() {
        for _ in 0..1000 {
            let jitter = rand_jitter();
            assert!((0.0..1.0).contains(&jitter));
        }
    }
}
