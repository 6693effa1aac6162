//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Base delay for the first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0), applied symmetrically.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(5 * 60),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (zero-based), never above `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let max_ms = self.max.as_millis() as f64;
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(attempt.min(62) as i32);
        let delay = delay.min(max_ms);

        let jitter = if self.jitter > 0.0 {
            delay * self.jitter * rand::rng().random_range(-1.0..=1.0)
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter).clamp(0.0, max_ms) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 1_000)]
    #[case(1, 2_000)]
    #[case(3, 8_000)]
    #[case(8, 256_000)]
    #[case(9, 300_000)]
    #[case(40, 300_000)]
    fn test_delay_without_jitter(#[case] attempt: u32, #[case] expected_ms: u64) {
        let policy = BackoffPolicy::default().with_jitter(0.0);
        assert_eq!(policy.delay(attempt), Duration::from_millis(expected_ms));
    }

    proptest! {
        #[test]
        fn prop_delay_within_jitter_band(attempt in 0u32..80, jitter in 0.0f64..1.0) {
            let policy = BackoffPolicy::default().with_jitter(jitter);
            let nominal = BackoffPolicy::default().with_jitter(0.0).delay(attempt).as_millis() as f64;
            let got = policy.delay(attempt).as_millis() as f64;

            prop_assert!(got <= policy.max.as_millis() as f64);
            prop_assert!(got >= (nominal * (1.0 - jitter)).floor() - 1.0);
            prop_assert!(got <= (nominal * (1.0 + jitter)).ceil() + 1.0);
        }
    }
}
