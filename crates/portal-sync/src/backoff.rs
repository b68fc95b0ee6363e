//! Reconnect delay schedule.

use std::time::Duration;

/// Exponential reconnect schedule: `min(base * factor^attempt, max)`.
///
/// Deterministic; there is no jitter, so clients that lose the endpoint at the
/// same moment retry in lockstep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay_ms: u64,
    pub growth_factor: f64,
    pub max_delay_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            growth_factor: 1.5,
            max_delay_ms: 30_000,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base_delay_ms: u64, growth_factor: f64, max_delay_ms: u64) -> Self {
        let base_delay_ms = base_delay_ms.max(1);
        let growth_factor = if growth_factor.is_finite() {
            growth_factor.max(1.0)
        } else {
            1.0
        };
        Self {
            base_delay_ms,
            growth_factor,
            max_delay_ms: max_delay_ms.max(base_delay_ms),
        }
    }

    /// Delay before retry number `attempt` (0 for the first retry).
    pub fn compute_delay_ms(&self, attempt: u32) -> u64 {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.base_delay_ms as f64 * self.growth_factor.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay_ms as f64 {
            return self.max_delay_ms;
        }
        (scaled.round() as u64).min(self.max_delay_ms)
    }

    pub fn compute_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.compute_delay_ms(attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::BackoffPolicy;

    #[test]
    fn default_schedule_grows_by_half_and_caps() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.compute_delay_ms(0), 1_000);
        assert_eq!(policy.compute_delay_ms(1), 1_500);
        assert_eq!(policy.compute_delay_ms(2), 2_250);
        assert_eq!(policy.compute_delay_ms(3), 3_375);
        assert_eq!(policy.compute_delay_ms(8), 25_629);
        assert_eq!(policy.compute_delay_ms(9), 30_000);
        assert_eq!(policy.compute_delay_ms(u32::MAX), 30_000);
    }

    #[test]
    fn delay_is_bounded_and_non_decreasing() {
        let policy = BackoffPolicy::default();
        let mut previous = policy.compute_delay_ms(0);
        assert!(previous <= 30_000);
        for attempt in 1..=20 {
            let delay = policy.compute_delay_ms(attempt);
            assert!(delay <= 30_000, "attempt {attempt} exceeded the cap: {delay}");
            assert!(
                delay >= previous,
                "attempt {attempt} decreased: {delay} < {previous}"
            );
            previous = delay;
        }
    }

    #[test]
    fn degenerate_settings_are_clamped() {
        let policy = BackoffPolicy::new(0, 0.5, 0);
        assert_eq!(policy.base_delay_ms, 1);
        assert_eq!(policy.growth_factor, 1.0);
        assert_eq!(policy.max_delay_ms, 1);
        assert_eq!(policy.compute_delay_ms(10), 1);

        let nan = BackoffPolicy::new(500, f64::NAN, 2_000);
        assert_eq!(nan.compute_delay_ms(5), 500);
    }
}
