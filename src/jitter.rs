//! Jitter strategies to spread out retry storms.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Randomization applied to retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Jitter {
    /// Use the exact backoff delay.
    #[default]
    None,
    /// Random delay in `[0, delay]`.
    Full,
    /// Random delay in `[delay/2, delay]`.
    Equal,
}

impl Jitter {
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::rng())
    }

    /// Apply jitter with a caller-supplied RNG (deterministic in tests).
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        let millis = delay.as_millis() as u64;
        if millis == 0 {
            return Duration::ZERO;
        }
        match self {
            Jitter::None => delay,
            Jitter::Full => Duration::from_millis(rng.random_range(0..=millis)),
            Jitter::Equal => Duration::from_millis(rng.random_range(millis / 2..=millis)),
        }
    }
}
