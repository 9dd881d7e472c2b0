// Backoff for store operations that failed transiently
//
// The coordinator retries acquisition and job completion after storage or
// lock failures; these strategies decide how long it waits between tries.

use rand::Rng;
use std::time::Duration;

/// Calculates the wait before the next attempt
pub trait RetryStrategy: Send + Sync {
    /// Delay after `attempt` consecutive failures (0-based). `None` means
    /// give up.
    fn next_delay(&self, attempt: u32) -> Option<Duration>;

    fn should_retry(&self, attempt: u32) -> bool {
        self.next_delay(attempt).is_some()
    }
}

/// Doubling backoff with optional jitter, capped at `max_delay`.
/// Retries forever unless a retry limit is set.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    /// 0.0 to 1.0; fraction of the delay added at random
    jitter_factor: f64,
    max_retries: Option<u32>,
}

impl ExponentialBackoff {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            jitter_factor: 0.0,
            max_retries: None,
        }
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    fn base_delay_for(&self, attempt: u32) -> Duration {
        let factor = 2_u32.checked_pow(attempt.min(31)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn add_jitter(&self, delay: Duration) -> Duration {
        if self.jitter_factor == 0.0 {
            return delay;
        }
        let range_ms = (delay.as_millis() as f64 * self.jitter_factor) as u64;
        if range_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=range_ms))
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if self.max_retries.is_some_and(|max| attempt >= max) {
            return None;
        }
        Some(self.add_jitter(self.base_delay_for(attempt)))
    }
}

/// Same delay every time
#[derive(Debug, Clone)]
pub struct FixedDelay {
    delay: Duration,
    max_retries: Option<u32>,
}

impl FixedDelay {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            max_retries: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

impl RetryStrategy for FixedDelay {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if self.max_retries.is_some_and(|max| attempt >= max) {
            return None;
        }
        Some(self.delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_doubles_until_cap() {
        let strategy = ExponentialBackoff::new(Duration::from_millis(500), Duration::from_secs(5));

        assert_eq!(strategy.next_delay(0), Some(Duration::from_millis(500)));
        assert_eq!(strategy.next_delay(1), Some(Duration::from_millis(1000)));
        assert_eq!(strategy.next_delay(3), Some(Duration::from_millis(4000)));
        assert_eq!(strategy.next_delay(4), Some(Duration::from_secs(5)));
        assert_eq!(strategy.next_delay(200), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_unbounded_by_default() {
        let strategy = ExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(1));
        assert!(strategy.should_retry(10_000));
        assert!(FixedDelay::new(Duration::from_millis(10)).should_retry(u32::MAX));
    }

    #[test]
    fn test_retry_limit_enforcement() {
        let strategy = ExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(1))
            .with_max_retries(3);
        assert!(strategy.should_retry(2));
        assert!(!strategy.should_retry(3));
        assert_eq!(strategy.next_delay(4), None);

        let fixed = FixedDelay::new(Duration::from_secs(15)).with_max_retries(1);
        assert_eq!(fixed.next_delay(0), Some(Duration::from_secs(15)));
        assert_eq!(fixed.next_delay(1), None);
    }

    #[test]
    fn test_jitter_stays_within_range() {
        let strategy = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(10))
            .with_jitter(0.2);
        for _ in 0..50 {
            let delay = strategy.next_delay(0).unwrap();
            assert!(delay >= Duration::from_millis(1000));
            assert!(delay <= Duration::from_millis(1200));
        }
    }

    #[test]
    fn test_jitter_factor_clamping() {
        let strategy = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(1))
            .with_jitter(-0.5);
        assert_eq!(strategy.jitter_factor, 0.0);
        let strategy = strategy.with_jitter(1.5);
        assert_eq!(strategy.jitter_factor, 1.0);
    }
}
