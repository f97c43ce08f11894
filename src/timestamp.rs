//! Timestamp hygiene for incoming entries.

use crate::config::{InvalidTimestampAction, TimestampConfig};
use std::time::SystemTime;

/// What the policy decided about one timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Inside the validity window; untouched.
    Valid,
    /// Too old; replaced with now.
    ClampedPast,
    /// Too far ahead; replaced with now.
    ClampedFuture,
    /// Outside the window but kept, action `warn`.
    Warned,
    /// Outside the window, action `reject`; drop the entry.
    Rejected,
}

/// Outcome of validating one timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub timestamp: SystemTime,
    pub disposition: Disposition,
}

/// Coerces entry timestamps into the configured validity window.
#[derive(Debug, Clone)]
pub struct TimestampPolicy {
    config: TimestampConfig,
}

impl TimestampPolicy {
    pub fn new(config: TimestampConfig) -> Self {
        Self { config }
    }

    pub fn clamp_to_dlq(&self) -> bool {
        self.config.clamp_to_dlq
    }

    /// Validate `timestamp` against the window around `now`.
    pub fn apply(&self, timestamp: SystemTime, now: SystemTime) -> Verdict {
        // A zero timestamp means the producer had no clock at all.
        let too_old = timestamp == SystemTime::UNIX_EPOCH
            || matches!(now.duration_since(timestamp), Ok(age) if age > self.config.max_past_age());
        let too_new = matches!(
            timestamp.duration_since(now),
            Ok(lead) if lead > self.config.max_future_age()
        );

        if !too_old && !too_new {
            return Verdict { timestamp, disposition: Disposition::Valid };
        }

        match self.config.invalid_action {
            InvalidTimestampAction::Clamp => Verdict {
                timestamp: now,
                disposition: if too_old {
                    Disposition::ClampedPast
                } else {
                    Disposition::ClampedFuture
                },
            },
            InvalidTimestampAction::Reject => {
                Verdict { timestamp, disposition: Disposition::Rejected }
            }
            InvalidTimestampAction::Warn => {
                tracing::warn!(?timestamp, "timestamp outside validity window, keeping as-is");
                Verdict { timestamp, disposition: Disposition::Warned }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn policy(action: InvalidTimestampAction) -> TimestampPolicy {
        TimestampPolicy::new(TimestampConfig {
            max_past_age_secs: 3_600,
            max_future_age_secs: 300,
            invalid_action: action,
            clamp_to_dlq: false,
        })
    }

    #[test]
    fn in_window_timestamps_pass_untouched() {
        let p = policy(InvalidTimestampAction::Clamp);
        let now = SystemTime::now();
        let ts = now - Duration::from_secs(60);
        let verdict = p.apply(ts, now);
        assert_eq!(verdict.disposition, Disposition::Valid);
        assert_eq!(verdict.timestamp, ts);
    }

    #[test]
    fn old_timestamps_clamp_to_now() {
        let p = policy(InvalidTimestampAction::Clamp);
        let now = SystemTime::now();
        let verdict = p.apply(now - Duration::from_secs(7_200), now);
        assert_eq!(verdict.disposition, Disposition::ClampedPast);
        assert_eq!(verdict.timestamp, now);
    }

    #[test]
    fn future_timestamps_clamp_to_now() {
        let p = policy(InvalidTimestampAction::Clamp);
        let now = SystemTime::now();
        let verdict = p.apply(now + Duration::from_secs(900), now);
        assert_eq!(verdict.disposition, Disposition::ClampedFuture);
        assert_eq!(verdict.timestamp, now);
    }

    #[test]
    fn reject_action_drops() {
        let p = policy(InvalidTimestampAction::Reject);
        let now = SystemTime::now();
        let verdict = p.apply(now - Duration::from_secs(7_200), now);
        assert_eq!(verdict.disposition, Disposition::Rejected);
    }

    #[test]
    fn warn_action_keeps_original() {
        let p = policy(InvalidTimestampAction::Warn);
        let now = SystemTime::now();
        let ts = now - Duration::from_secs(7_200);
        let verdict = p.apply(ts, now);
        assert_eq!(verdict.disposition, Disposition::Warned);
        assert_eq!(verdict.timestamp, ts);
    }

    #[test]
    fn zero_timestamp_is_invalid() {
        let p = policy(InvalidTimestampAction::Clamp);
        let now = SystemTime::now();
        let verdict = p.apply(SystemTime::UNIX_EPOCH, now);
        assert_eq!(verdict.disposition, Disposition::ClampedPast);
    }

    #[test]
    fn window_edges_are_inclusive() {
        let p = policy(InvalidTimestampAction::Reject);
        let now = SystemTime::now();
        assert_eq!(
            p.apply(now - Duration::from_secs(3_600), now).disposition,
            Disposition::Valid
        );
        assert_eq!(
            p.apply(now + Duration::from_secs(300), now).disposition,
            Disposition::Valid
        );
    }
}
