//! Exponential backoff with multiplicative jitter.
//!
//! ```text
//! delay(n) = min(base * 2^n * (1 + jitter * u), max)    u in [0, 1)
//! ```
//!
//! With `jitter < 1` the uncapped delay of attempt `n + 1` is always
//! strictly larger than that of attempt `n`, whatever samples are drawn.

use std::time::Duration;

use nodegrid_core::RetrySettings;

/// Largest exponent applied to the base delay; beyond this the cap
/// always wins anyway.
const MAX_EXPONENT: u32 = 32;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
    jitter: f64,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32, jitter: f64) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
            jitter: jitter.clamp(0.0, 0.999),
        }
    }

    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self::new(
            settings.base_delay,
            settings.max_delay,
            settings.max_attempts,
            settings.jitter,
        )
    }

    /// Whether restart number `attempt` (1-based) is still within budget.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }

    /// Delay before retry `attempt` (0-based) for a given jitter sample
    /// in `[0, 1)`.
    pub fn delay_with(&self, attempt: u32, sample: f64) -> Duration {
        let exponent = attempt.min(MAX_EXPONENT);
        let factor = 2f64.powi(exponent as i32) * (1.0 + self.jitter * sample.clamp(0.0, 1.0));
        let secs = self.base_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// Delay before retry `attempt` (0-based) with a random jitter sample.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, rand::random::<f64>())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(60), 5, 0.5)
    }

    #[test]
    fn zero_jitter_doubles() {
        let p = policy();
        assert_eq!(p.delay_with(0, 0.0), Duration::from_millis(100));
        assert_eq!(p.delay_with(1, 0.0), Duration::from_millis(200));
        assert_eq!(p.delay_with(3, 0.0), Duration::from_millis(800));
    }

    #[test]
    fn worst_case_jitter_still_increases() {
        let p = policy();
        // Highest sample on attempt n against lowest on attempt n + 1.
        for n in 0..8 {
            let high = p.delay_with(n, 0.999);
            let low = p.delay_with(n + 1, 0.0);
            assert!(low > high, "attempt {n}: {low:?} <= {high:?}");
        }
    }

    #[test]
    fn random_delays_strictly_increase_until_cap() {
        let p = policy();
        let delays: Vec<Duration> = (0..6).map(|n| p.delay(n)).collect();
        for pair in delays.windows(2) {
            assert!(pair[1] > pair[0], "{delays:?}");
        }
    }

    #[test]
    fn delay_is_capped() {
        let p = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(10), 5, 0.5);
        assert_eq!(p.delay_with(10, 0.5), Duration::from_secs(10));
        assert_eq!(p.delay_with(u32::MAX, 0.9), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let p = policy();
        for _ in 0..100 {
            let d = p.delay(2);
            assert!(d >= Duration::from_millis(400));
            assert!(d < Duration::from_millis(600));
        }
    }

    #[test]
    fn attempt_budget() {
        let p = policy();
        assert!(p.allows(1));
        assert!(p.allows(5));
        assert!(!p.allows(6));
    }
}
