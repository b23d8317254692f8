//! Exponential backoff with per-instance jitter.
//!
//! ```text
//! nominal(n) = min(base * multiplier^n, max)
//! delay(n)   = min(nominal(n) * f, max)      f in [1 - jitter, 1 + jitter]
//! ```
//!
//! `f` is drawn once when the policy is built. Worker instances that start
//! failing at the same moment therefore retry on different schedules, while a
//! single instance keeps `delay(n) <= delay(n + 1) <= max`.

use std::time::Duration;

/// Default spread of the jitter band (±20%).
pub const DEFAULT_JITTER: f64 = 0.2;

/// Exponents above this saturate to `max` anyway; keeps `powi` finite.
const MAX_EXPONENT: u32 = 63;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
    jitter_factor: f64,
}

impl BackoffPolicy {
    /// Create a policy with a random jitter factor in `[0.8, 1.2]`.
    pub fn new(base: Duration, max: Duration) -> Self {
        let factor = 1.0 - DEFAULT_JITTER + 2.0 * DEFAULT_JITTER * rand::random::<f64>();
        Self {
            base,
            max: max.max(base),
            multiplier: 2.0,
            jitter: DEFAULT_JITTER,
            jitter_factor: factor,
        }
    }

    /// Set the growth multiplier (values below 1.0 are raised to 1.0).
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = if multiplier.is_finite() {
            multiplier.max(1.0)
        } else {
            2.0
        };
        self
    }

    /// Pin the jitter factor; clamped into the jitter band.
    pub fn with_jitter_factor(mut self, factor: f64) -> Self {
        let low = 1.0 - self.jitter;
        let high = 1.0 + self.jitter;
        self.jitter_factor = if factor.is_finite() {
            factor.clamp(low, high)
        } else {
            1.0
        };
        self
    }

    /// Policy without jitter, for tests and deterministic tooling.
    pub fn without_jitter(self) -> Self {
        self.with_jitter_factor(1.0)
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max_delay(&self) -> Duration {
        self.max
    }

    pub fn jitter_factor(&self) -> f64 {
        self.jitter_factor
    }

    /// Un-jittered exponential delay for `failures` consecutive failures.
    pub fn nominal_delay(&self, failures: u32) -> Duration {
        to_duration(self.nominal_nanos(failures))
    }

    /// Delay to wait after `failures` consecutive failures.
    pub fn next_delay(&self, failures: u32) -> Duration {
        let jittered = self.nominal_nanos(failures) * self.jitter_factor;
        to_duration(jittered.min(self.max.as_nanos() as f64))
    }

    /// Inclusive band `next_delay(failures)` must fall in for any jitter factor.
    pub fn jitter_band(&self, failures: u32) -> (Duration, Duration) {
        let nominal = self.nominal_nanos(failures);
        let max = self.max.as_nanos() as f64;
        let low = (nominal * (1.0 - self.jitter)).min(max);
        let high = (nominal * (1.0 + self.jitter)).min(max);
        (to_duration(low), to_duration(high))
    }

    fn nominal_nanos(&self, failures: u32) -> f64 {
        let exponent = failures.min(MAX_EXPONENT) as i32;
        let raw = self.base.as_nanos() as f64 * self.multiplier.powi(exponent);
        let max = self.max.as_nanos() as f64;
        if raw.is_finite() { raw.min(max) } else { max }
    }
}

fn to_duration(nanos: f64) -> Duration {
    Duration::from_nanos(nanos.max(0.0) as u64)
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nominal_progression() {
        let policy =
            BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(2)).without_jitter();

        assert_eq!(policy.next_delay(0), Duration::from_millis(100));
        assert_eq!(policy.next_delay(1), Duration::from_millis(200));
        assert_eq!(policy.next_delay(2), Duration::from_millis(400));
        assert_eq!(policy.next_delay(4), Duration::from_millis(1600));
        assert_eq!(policy.next_delay(5), Duration::from_secs(2)); // Capped at max
        assert_eq!(policy.next_delay(u32::MAX), Duration::from_secs(2));
    }

    #[test]
    fn test_monotonic_and_capped_for_any_factor() {
        for factor in [0.8, 0.9, 1.0, 1.13, 1.2] {
            let policy = BackoffPolicy::new(Duration::from_millis(250), Duration::from_secs(10))
                .with_jitter_factor(factor);

            for n in 0..40 {
                let current = policy.next_delay(n);
                let next = policy.next_delay(n + 1);
                assert!(current <= next, "factor {factor}: delay({n}) > delay({})", n + 1);
                assert!(next <= policy.max_delay());
            }
        }
    }

    #[test]
    fn test_delay_within_jitter_band() {
        for _ in 0..50 {
            let policy = BackoffPolicy::new(Duration::from_millis(500), Duration::from_secs(30));
            assert!((1.0 - DEFAULT_JITTER..=1.0 + DEFAULT_JITTER).contains(&policy.jitter_factor()));

            for n in 0..12 {
                let (low, high) = policy.jitter_band(n);
                let delay = policy.next_delay(n);
                assert!(low <= delay && delay <= high, "delay({n}) = {delay:?} outside band");
            }
        }
    }

    #[test]
    fn test_jitter_factor_is_clamped() {
        let policy = BackoffPolicy::default().with_jitter_factor(3.0);
        assert_eq!(policy.jitter_factor(), 1.0 + DEFAULT_JITTER);

        let policy = BackoffPolicy::default().with_jitter_factor(f64::NAN);
        assert_eq!(policy.jitter_factor(), 1.0);
    }

    #[test]
    fn test_max_below_base_is_raised() {
        let policy = BackoffPolicy::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(policy.max_delay(), Duration::from_secs(5));
    }
}
