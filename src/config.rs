//! Pipeline configuration.
//!
//! Plain serde-deserializable structs with production defaults. Loading (files,
//! hot reload) lives with the embedding binary; this crate only validates
//! what it is handed and applies `LOGSLUICE_*` environment overrides.

use crate::backpressure::BackpressureLevel;
use crate::degrade::Feature;
use crate::jitter::Jitter;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config: {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("invalid environment override {var}: {reason}")]
    Env { var: String, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid { field, reason: reason.into() }
}

/// Fingerprint hash selection for the dedup cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    #[default]
    Xxh64,
    Sha256,
}

/// What to do with a timestamp outside the validity window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidTimestampAction {
    /// Replace with the current wall clock.
    #[default]
    Clamp,
    /// Drop the entry.
    Reject,
    /// Keep as-is, log a warning.
    Warn,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub enabled: bool,
    pub max_cache_size: usize,
    pub ttl_secs: u64,
    pub cleanup_interval_secs: u64,
    /// Utilization above which the sweeper trims the LRU tail.
    pub cleanup_threshold: f64,
    pub hash_algorithm: HashAlgorithm,
    pub include_timestamp: bool,
    pub include_source_id: bool,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_cache_size: 10_000,
            ttl_secs: 300,
            cleanup_interval_secs: 60,
            cleanup_threshold: 0.9,
            hash_algorithm: HashAlgorithm::Xxh64,
            include_timestamp: false,
            include_source_id: true,
        }
    }
}

impl DedupConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: usize,
    pub success_threshold: usize,
    pub timeout_ms: u64,
    pub half_open_max_calls: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_ms: 30_000,
            half_open_max_calls: 1,
        }
    }
}

impl BreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReprocessConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub batch_size: usize,
    pub max_retries: u32,
    /// Entries younger than this are left alone.
    pub min_entry_age_secs: u64,
    pub initial_delay_secs: u64,
    pub delay_multiplier: f64,
    pub max_delay_secs: u64,
}

impl Default for ReprocessConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 60,
            batch_size: 100,
            max_retries: 5,
            min_entry_age_secs: 60,
            initial_delay_secs: 60,
            delay_multiplier: 2.0,
            max_delay_secs: 3_600,
        }
    }
}

impl ReprocessConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn min_entry_age(&self) -> Duration {
        Duration::from_secs(self.min_entry_age_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DlqConfig {
    pub enabled: bool,
    pub queue_size: usize,
    pub directory: PathBuf,
    pub max_files: usize,
    pub max_file_size_mb: u64,
    pub retention_days: u64,
    pub flush_interval_ms: u64,
    pub reprocessing: ReprocessConfig,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_size: 1_000,
            directory: PathBuf::from("dlq"),
            max_files: 10,
            max_file_size_mb: 100,
            retention_days: 7,
            flush_interval_ms: 1_000,
            reprocessing: ReprocessConfig::default(),
        }
    }
}

impl DlqConfig {
    pub fn max_file_size(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days * 24 * 3600)
    }
}

/// Weights of the backpressure score inputs. Should sum to 1.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackpressureWeights {
    pub queue: f64,
    pub memory: f64,
    pub cpu: f64,
    pub io: f64,
    pub error_rate: f64,
}

impl Default for BackpressureWeights {
    fn default() -> Self {
        Self { queue: 0.30, memory: 0.25, cpu: 0.20, io: 0.15, error_rate: 0.10 }
    }
}

impl BackpressureWeights {
    pub fn sum(&self) -> f64 {
        self.queue + self.memory + self.cpu + self.io + self.error_rate
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    /// Score thresholds for Low/Medium/High/Critical, ascending.
    pub thresholds: [f64; 4],
    pub weights: BackpressureWeights,
    /// Rate-limiter admission factor per level None..Critical.
    pub admission_factors: [f64; 5],
    pub cooldown_ms: u64,
    pub stabilize_ms: u64,
    pub sample_interval_ms: u64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            thresholds: [0.60, 0.75, 0.90, 0.95],
            weights: BackpressureWeights::default(),
            admission_factors: [1.0, 0.9, 0.7, 0.5, 0.2],
            cooldown_ms: 5_000,
            stabilize_ms: 10_000,
            sample_interval_ms: 1_000,
        }
    }
}

impl BackpressureConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn stabilize(&self) -> Duration {
        Duration::from_millis(self.stabilize_ms)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DegradeConfig {
    pub enabled: bool,
    /// Backpressure level at which each optional feature is switched off.
    pub disable_at: HashMap<Feature, BackpressureLevel>,
    pub restore_delay_ms: u64,
    pub min_degraded_time_ms: u64,
}

impl Default for DegradeConfig {
    fn default() -> Self {
        let mut disable_at = HashMap::new();
        disable_at.insert(Feature::VerboseLogging, BackpressureLevel::Low);
        disable_at.insert(Feature::DetailedMetrics, BackpressureLevel::Medium);
        disable_at.insert(Feature::HealthCheckVerbosity, BackpressureLevel::Medium);
        disable_at.insert(Feature::Compression, BackpressureLevel::High);
        disable_at.insert(Feature::Deduplication, BackpressureLevel::High);
        disable_at.insert(Feature::BatchOptimization, BackpressureLevel::Critical);
        Self {
            enabled: true,
            disable_at,
            restore_delay_ms: 30_000,
            min_degraded_time_ms: 60_000,
        }
    }
}

impl DegradeConfig {
    pub fn restore_delay(&self) -> Duration {
        Duration::from_millis(self.restore_delay_ms)
    }

    pub fn min_degraded_time(&self) -> Duration {
        Duration::from_millis(self.min_degraded_time_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub initial_rps: f64,
    pub min_rps: f64,
    pub max_rps: f64,
    /// Burst capacity as seconds of sustained rate.
    pub burst_secs: f64,
    pub latency_target_ms: u64,
    pub latency_tolerance: f64,
    pub adaptation_interval_ms: u64,
    /// Relative step per adaptation tick.
    pub adaptation_factor: f64,
    /// Smoothing weight kept on the previous rate.
    pub smoothing: f64,
    /// EWMA weight for new latency samples.
    pub ewma_alpha: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_rps: 1_000.0,
            min_rps: 10.0,
            max_rps: 10_000.0,
            burst_secs: 1.0,
            latency_target_ms: 100,
            latency_tolerance: 0.2,
            adaptation_interval_ms: 5_000,
            adaptation_factor: 0.1,
            smoothing: 0.3,
            ewma_alpha: 0.3,
        }
    }
}

impl RateLimitConfig {
    pub fn latency_target(&self) -> Duration {
        Duration::from_millis(self.latency_target_ms)
    }

    pub fn adaptation_interval(&self) -> Duration {
        Duration::from_millis(self.adaptation_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimestampConfig {
    pub max_past_age_secs: u64,
    pub max_future_age_secs: u64,
    pub invalid_action: InvalidTimestampAction,
    /// Also park clamped entries in the DLQ (audit trail of bad clocks).
    pub clamp_to_dlq: bool,
}

impl Default for TimestampConfig {
    fn default() -> Self {
        Self {
            max_past_age_secs: 86_400,
            max_future_age_secs: 300,
            invalid_action: InvalidTimestampAction::Clamp,
            clamp_to_dlq: false,
        }
    }
}

impl TimestampConfig {
    pub fn max_past_age(&self) -> Duration {
        Duration::from_secs(self.max_past_age_secs)
    }

    pub fn max_future_age(&self) -> Duration {
        Duration::from_secs(self.max_future_age_secs)
    }
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub queue_size: usize,
    pub workers: usize,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_jitter: Jitter,
    pub shutdown_grace_ms: u64,
    /// Entries the freelist pool retains.
    pub pool_retain: usize,
    pub dedup: DedupConfig,
    pub breaker: BreakerConfig,
    pub dlq: DlqConfig,
    pub backpressure: BackpressureConfig,
    pub degrade: DegradeConfig,
    pub rate_limit: RateLimitConfig,
    pub timestamp: TimestampConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_size: 10_000,
            workers: 4,
            batch_size: 100,
            batch_timeout_ms: 1_000,
            max_retries: 3,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 30_000,
            retry_jitter: Jitter::None,
            shutdown_grace_ms: 5_000,
            pool_retain: 1_024,
            dedup: DedupConfig::default(),
            breaker: BreakerConfig::default(),
            dlq: DlqConfig::default(),
            backpressure: BackpressureConfig::default(),
            degrade: DegradeConfig::default(),
            rate_limit: RateLimitConfig::default(),
            timestamp: TimestampConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Check the whole tree for values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_size == 0 {
            return Err(invalid("queue_size", "must be > 0"));
        }
        if self.workers == 0 {
            return Err(invalid("workers", "must be > 0"));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch_size", "must be > 0"));
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(invalid("retry_max_delay_ms", "must be >= retry_base_delay_ms"));
        }
        if self.dedup.max_cache_size == 0 {
            return Err(invalid("dedup.max_cache_size", "must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.dedup.cleanup_threshold) {
            return Err(invalid("dedup.cleanup_threshold", "must be within [0, 1]"));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(invalid("breaker.failure_threshold", "must be > 0"));
        }
        if self.breaker.success_threshold == 0 {
            return Err(invalid("breaker.success_threshold", "must be > 0"));
        }
        if self.breaker.half_open_max_calls == 0 {
            return Err(invalid("breaker.half_open_max_calls", "must be > 0"));
        }
        if self.dlq.enabled && self.dlq.queue_size == 0 {
            return Err(invalid("dlq.queue_size", "must be > 0"));
        }
        if self.dlq.enabled && self.dlq.max_files == 0 {
            return Err(invalid("dlq.max_files", "must be > 0"));
        }
        if self.dlq.reprocessing.delay_multiplier < 1.0 {
            return Err(invalid("dlq.reprocessing.delay_multiplier", "must be >= 1"));
        }
        let t = &self.backpressure.thresholds;
        if !t.windows(2).all(|w| w[0] < w[1]) || t[0] <= 0.0 || t[3] > 1.0 {
            return Err(invalid(
                "backpressure.thresholds",
                "must be ascending within (0, 1]",
            ));
        }
        let weight_sum = self.backpressure.weights.sum();
        if (weight_sum - 1.0).abs() > 0.01 {
            return Err(invalid(
                "backpressure.weights",
                format!("must sum to 1.0 (got {weight_sum:.3})"),
            ));
        }
        for factor in self.backpressure.admission_factors {
            if !(0.0 < factor && factor <= 1.0) {
                return Err(invalid(
                    "backpressure.admission_factors",
                    "each factor must be within (0, 1]",
                ));
            }
        }
        let rl = &self.rate_limit;
        if rl.enabled {
            if rl.min_rps <= 0.0 || rl.min_rps > rl.initial_rps || rl.initial_rps > rl.max_rps {
                return Err(invalid(
                    "rate_limit",
                    "requires 0 < min_rps <= initial_rps <= max_rps",
                ));
            }
            if !(0.0 < rl.adaptation_factor && rl.adaptation_factor < 1.0) {
                return Err(invalid("rate_limit.adaptation_factor", "must be within (0, 1)"));
            }
            if !(0.0..1.0).contains(&rl.smoothing) {
                return Err(invalid("rate_limit.smoothing", "must be within [0, 1)"));
            }
            if !(0.0 < rl.ewma_alpha && rl.ewma_alpha <= 1.0) {
                return Err(invalid("rate_limit.ewma_alpha", "must be within (0, 1]"));
            }
        }
        Ok(())
    }

    /// Shadow scalar keys with `LOGSLUICE_*` environment variables.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        override_from_env("LOGSLUICE_QUEUE_SIZE", &mut self.queue_size)?;
        override_from_env("LOGSLUICE_WORKERS", &mut self.workers)?;
        override_from_env("LOGSLUICE_BATCH_SIZE", &mut self.batch_size)?;
        override_from_env("LOGSLUICE_BATCH_TIMEOUT_MS", &mut self.batch_timeout_ms)?;
        override_from_env("LOGSLUICE_MAX_RETRIES", &mut self.max_retries)?;
        override_from_env("LOGSLUICE_RETRY_BASE_DELAY_MS", &mut self.retry_base_delay_ms)?;
        override_from_env("LOGSLUICE_RETRY_MAX_DELAY_MS", &mut self.retry_max_delay_ms)?;
        override_from_env("LOGSLUICE_SHUTDOWN_GRACE_MS", &mut self.shutdown_grace_ms)?;
        override_from_env("LOGSLUICE_DEDUP_ENABLED", &mut self.dedup.enabled)?;
        override_from_env("LOGSLUICE_DEDUP_MAX_CACHE_SIZE", &mut self.dedup.max_cache_size)?;
        override_from_env("LOGSLUICE_DEDUP_TTL_SECS", &mut self.dedup.ttl_secs)?;
        override_from_env("LOGSLUICE_DLQ_ENABLED", &mut self.dlq.enabled)?;
        override_from_env("LOGSLUICE_DLQ_QUEUE_SIZE", &mut self.dlq.queue_size)?;
        override_from_env("LOGSLUICE_DLQ_MAX_FILES", &mut self.dlq.max_files)?;
        override_from_env("LOGSLUICE_DLQ_RETENTION_DAYS", &mut self.dlq.retention_days)?;
        override_from_env("LOGSLUICE_RATE_LIMIT_ENABLED", &mut self.rate_limit.enabled)?;
        override_from_env("LOGSLUICE_RATE_LIMIT_INITIAL_RPS", &mut self.rate_limit.initial_rps)?;
        override_from_env("LOGSLUICE_RATE_LIMIT_MIN_RPS", &mut self.rate_limit.min_rps)?;
        override_from_env("LOGSLUICE_RATE_LIMIT_MAX_RPS", &mut self.rate_limit.max_rps)?;
        if let Ok(dir) = std::env::var("LOGSLUICE_DLQ_DIRECTORY") {
            self.dlq.directory = PathBuf::from(dir);
        }
        Ok(())
    }
}

fn override_from_env<T>(var: &str, slot: &mut T) -> Result<(), ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Ok(raw) => match raw.parse() {
            Ok(value) => {
                *slot = value;
                Ok(())
            }
            Err(e) => Err(ConfigError::Env { var: var.to_string(), reason: e.to_string() }),
        },
        Err(_) => Ok(()),
    }
}
