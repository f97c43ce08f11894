//! Latency-adaptive token-bucket rate limiter.
//!
//! `allow()` is a non-blocking token-bucket check. Workers feed sink-send
//! latencies into an EWMA; a background loop periodically nudges the rate
//! toward the latency target, smoothed and clamped to the configured band.
//! Backpressure multiplies an admission factor into the effective rate.

use crate::clock::Clock;
use crate::config::RateLimitConfig;
use crate::sleeper::{Sleeper, TokioSleeper};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// f64 stored as bits so hot paths skip the mutex.
#[derive(Debug)]
struct AtomicF64(AtomicU64);

impl AtomicF64 {
    fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill_millis: u64,
}

/// Token bucket whose rate auto-tunes to a latency SLO.
#[derive(Debug)]
pub struct AdaptiveRateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    bucket: Mutex<Bucket>,
    /// Adapted base rate, tokens per second.
    rate: AtomicF64,
    /// Multiplier pushed in by backpressure, `(0, 1]`.
    admission: AtomicF64,
    /// EWMA of recorded sink latencies, in milliseconds.
    avg_latency_ms: AtomicF64,
    /// Samples seen since the last adaptation tick.
    samples: AtomicU64,
}

impl AdaptiveRateLimiter {
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_millis();
        let initial = config.initial_rps;
        let burst = initial * config.burst_secs;
        Self {
            config,
            clock,
            bucket: Mutex::new(Bucket { tokens: burst, last_refill_millis: now }),
            rate: AtomicF64::new(initial),
            admission: AtomicF64::new(1.0),
            avg_latency_ms: AtomicF64::new(0.0),
            samples: AtomicU64::new(0),
        }
    }

    /// Current adapted rate, before the admission factor.
    pub fn rate(&self) -> f64 {
        self.rate.load()
    }

    /// Rate actually enforced right now.
    pub fn effective_rate(&self) -> f64 {
        self.rate.load() * self.admission.load()
    }

    pub fn set_admission_factor(&self, factor: f64) {
        self.admission.store(factor.clamp(f64::MIN_POSITIVE, 1.0));
    }

    /// Try to take one token. On denial returns how long the caller would
    /// have to wait for one.
    pub fn allow(&self) -> Result<(), Duration> {
        if !self.config.enabled {
            return Ok(());
        }
        let rate = self.effective_rate();
        let burst = (rate * self.config.burst_secs).max(1.0);
        let now = self.clock.now_millis();

        let mut bucket = self
            .bucket
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let elapsed = now.saturating_sub(bucket.last_refill_millis) as f64 / 1_000.0;
        bucket.tokens = (bucket.tokens + elapsed * rate).min(burst);
        bucket.last_refill_millis = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - bucket.tokens;
            Err(Duration::from_secs_f64(missing / rate))
        }
    }

    /// Feed one sink-send latency into the EWMA.
    pub fn record_latency(&self, latency: Duration) {
        let sample = latency.as_secs_f64() * 1_000.0;
        let alpha = self.config.ewma_alpha;
        // CAS loop: concurrent recorders fold into the same average.
        loop {
            let current = self.avg_latency_ms.0.load(Ordering::Relaxed);
            let avg = f64::from_bits(current);
            let next = if self.samples.load(Ordering::Relaxed) == 0 && avg == 0.0 {
                sample
            } else {
                alpha * sample + (1.0 - alpha) * avg
            };
            if self
                .avg_latency_ms
                .0
                .compare_exchange_weak(
                    current,
                    next.to_bits(),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                break;
            }
        }
        self.samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn average_latency(&self) -> Duration {
        Duration::from_secs_f64(self.avg_latency_ms.load().max(0.0) / 1_000.0)
    }

    /// One adaptation step. Exposed for tests; production runs it from
    /// [`Self::spawn_adaptation`].
    pub fn adapt(&self) {
        if !self.config.enabled {
            return;
        }
        if self.samples.swap(0, Ordering::Relaxed) == 0 {
            return;
        }
        let avg = self.avg_latency_ms.load();
        let target = self.config.latency_target_ms as f64;
        let current = self.rate.load();

        let candidate = if avg > target * (1.0 + self.config.latency_tolerance) {
            current * (1.0 - self.config.adaptation_factor)
        } else if avg < 0.8 * target {
            current * (1.0 + self.config.adaptation_factor)
        } else {
            return;
        };

        let smoothing = self.config.smoothing;
        let smoothed = smoothing * current + (1.0 - smoothing) * candidate;
        let clamped = smoothed.clamp(self.config.min_rps, self.config.max_rps);
        if (clamped - current).abs() > f64::EPSILON {
            tracing::debug!(
                avg_latency_ms = avg,
                rate = clamped,
                previous = current,
                "rate limiter adapted"
            );
        }
        self.rate.store(clamped);
    }

    /// Run the adaptation loop until cancellation.
    pub fn spawn_adaptation(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let limiter = self.clone();
        let sleeper = TokioSleeper;
        tokio::spawn(async move {
            let interval = limiter.config.adaptation_interval();
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleeper.sleep(interval) => limiter.adapt(),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn config() -> RateLimitConfig {
        RateLimitConfig {
            enabled: true,
            initial_rps: 100.0,
            min_rps: 10.0,
            max_rps: 1_000.0,
            burst_secs: 1.0,
            latency_target_ms: 100,
            latency_tolerance: 0.2,
            adaptation_interval_ms: 1_000,
            adaptation_factor: 0.1,
            smoothing: 0.3,
            ewma_alpha: 0.5,
        }
    }

    fn limiter(clock: ManualClock) -> AdaptiveRateLimiter {
        AdaptiveRateLimiter::new(config(), Arc::new(clock))
    }

    #[test]
    fn burst_then_deny_then_refill() {
        let clock = ManualClock::new();
        let l = limiter(clock.clone());

        // Full burst of 100 tokens.
        for _ in 0..100 {
            l.allow().unwrap();
        }
        let wait = l.allow().unwrap_err();
        assert!(wait > Duration::ZERO);

        // 100 tokens/s: 50ms buys 5 tokens.
        clock.advance(50);
        for _ in 0..5 {
            l.allow().unwrap();
        }
        assert!(l.allow().is_err());
    }

    #[test]
    fn disabled_limiter_always_allows() {
        let l = AdaptiveRateLimiter::new(
            RateLimitConfig { enabled: false, ..config() },
            Arc::new(ManualClock::new()),
        );
        for _ in 0..10_000 {
            l.allow().unwrap();
        }
    }

    #[test]
    fn slow_latencies_shrink_the_rate() {
        let l = limiter(ManualClock::new());
        let before = l.rate();
        for _ in 0..20 {
            l.record_latency(Duration::from_millis(200));
        }
        l.adapt();
        assert!(l.rate() < before, "rate should strictly decrease");
        assert!(l.rate() >= 10.0);
    }

    #[test]
    fn fast_latencies_grow_the_rate() {
        let l = limiter(ManualClock::new());
        let before = l.rate();
        for _ in 0..20 {
            l.record_latency(Duration::from_millis(50));
        }
        l.adapt();
        assert!(l.rate() > before, "rate should strictly increase");
        assert!(l.rate() <= 1_000.0);
    }

    #[test]
    fn in_band_latencies_leave_rate_alone() {
        let l = limiter(ManualClock::new());
        for _ in 0..20 {
            l.record_latency(Duration::from_millis(100));
        }
        l.adapt();
        assert!((l.rate() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn adaptation_without_samples_is_a_no_op() {
        let l = limiter(ManualClock::new());
        l.record_latency(Duration::from_millis(500));
        l.adapt();
        let after_first = l.rate();
        assert!(after_first < 100.0);

        // No new samples since the last tick: rate holds.
        l.adapt();
        assert!((l.rate() - after_first).abs() < 1e-9);
    }

    #[test]
    fn rate_never_leaves_the_configured_band() {
        let l = limiter(ManualClock::new());
        for _ in 0..200 {
            l.record_latency(Duration::from_secs(10));
            l.adapt();
        }
        assert!((l.rate() - 10.0).abs() < 1e-9, "clamped at min_rps");

        for _ in 0..200 {
            l.record_latency(Duration::from_millis(1));
            l.adapt();
        }
        assert!(l.rate() <= 1_000.0);
    }

    #[test]
    fn admission_factor_scales_effective_rate() {
        let clock = ManualClock::new();
        let l = limiter(clock.clone());
        l.set_admission_factor(0.2);
        assert!((l.effective_rate() - 20.0).abs() < 1e-9);

        // Drain the (rescaled) burst of 20 and verify the refill rate.
        let mut granted = 0;
        while l.allow().is_ok() {
            granted += 1;
            assert!(granted <= 200, "bucket failed to bound");
        }
        assert!(granted <= 100);
        clock.advance(1_000);
        let mut refilled = 0;
        while l.allow().is_ok() {
            refilled += 1;
        }
        assert_eq!(refilled, 20, "one second at 20 rps");
    }

    #[test]
    fn ewma_tracks_recent_samples_harder() {
        let l = limiter(ManualClock::new());
        l.record_latency(Duration::from_millis(100));
        l.record_latency(Duration::from_millis(300));
        // alpha 0.5: 0.5*300 + 0.5*100 = 200
        assert_eq!(l.average_latency(), Duration::from_millis(200));
    }
}
