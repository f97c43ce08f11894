//! Backoff schedules for sink retries and DLQ reprocessing.

use std::time::Duration;

/// Delay schedule for repeated attempts.
#[derive(Debug, Clone)]
pub enum Backoff {
    /// Fixed delay between attempts.
    Constant { delay: Duration },
    /// Geometrically increasing delay, capped at `max`.
    Exponential { base: Duration, factor: f64, max: Duration },
}

impl Backoff {
    pub fn constant(delay: Duration) -> Self {
        Backoff::Constant { delay }
    }

    /// Doubling schedule capped at `max`: `base * 2^(attempt-1)`.
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Backoff::Exponential { base, factor: 2.0, max }
    }

    /// Geometric schedule with an arbitrary multiplier, capped at `max`:
    /// `base * factor^(attempt-1)`.
    pub fn geometric(base: Duration, factor: f64, max: Duration) -> Self {
        Backoff::Exponential { base, factor, max }
    }

    /// Delay before the given attempt (1-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Constant { delay } => *delay,
            Backoff::Exponential { base, factor, max } => {
                let exponent = attempt.saturating_sub(1);
                let multiplier = factor.max(1.0).powi(exponent.min(63) as i32);
                let scaled = base.as_secs_f64() * multiplier;
                if !scaled.is_finite() || scaled >= max.as_secs_f64() {
                    *max
                } else {
                    Duration::from_secs_f64(scaled)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_returns_same_delay() {
        let backoff = Backoff::constant(Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(50), Duration::from_millis(100));
    }

    #[test]
    fn exponential_doubles_each_attempt() {
        let backoff = Backoff::exponential(Duration::from_millis(100), Duration::from_secs(60));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
    }

    #[test]
    fn exponential_respects_cap() {
        let backoff = Backoff::exponential(Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(4), Duration::from_millis(500));
        assert_eq!(backoff.delay(30), Duration::from_millis(500));
    }

    #[test]
    fn geometric_uses_custom_factor() {
        let backoff =
            Backoff::geometric(Duration::from_secs(1), 3.0, Duration::from_secs(100));
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(3));
        assert_eq!(backoff.delay(3), Duration::from_secs(9));
        assert_eq!(backoff.delay(5), Duration::from_secs(81));
        assert_eq!(backoff.delay(6), Duration::from_secs(100));
    }

    #[test]
    fn huge_attempt_numbers_saturate_to_cap() {
        let backoff = Backoff::exponential(Duration::from_secs(1), Duration::from_secs(300));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn factor_below_one_behaves_as_constant() {
        let backoff = Backoff::geometric(Duration::from_secs(2), 0.5, Duration::from_secs(10));
        assert_eq!(backoff.delay(1), Duration::from_secs(2));
        assert_eq!(backoff.delay(4), Duration::from_secs(2));
    }
}
