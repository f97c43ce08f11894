#![forbid(unsafe_code)]

//! # logsluice
//!
//! The core pipeline of a log-capture agent: entries flow from sources into
//! a bounded queue, get batched by a worker pool, and are delivered to every
//! registered sink with at-least-once semantics under bounded memory.
//!
//! ## Components
//!
//! - **Dispatcher** — ingress policy, bounded queue, batching workers,
//!   per-sink retry with exponential backoff
//! - **Dedup cache** — content-hash suppression with LRU + TTL eviction
//! - **Circuit breakers** — per-sink three-state failure isolation
//! - **Dead-letter queue** — rotating on-disk parking lot with bounded
//!   reprocessing
//! - **Backpressure & degradation** — weighted utilization score that sheds
//!   optional features and scales admission
//! - **Adaptive rate limiter** — token bucket tuned to a latency SLO
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use logsluice::{Dispatcher, PipelineConfig, PipelineMetrics};
//! use tokio_util::sync::CancellationToken;
//!
//! # #[derive(Debug)] struct StdoutSink;
//! # #[async_trait::async_trait]
//! # impl logsluice::Sink for StdoutSink {
//! #     async fn start(&self, _t: CancellationToken) -> Result<(), logsluice::SinkError> { Ok(()) }
//! #     async fn stop(&self) -> Result<(), logsluice::SinkError> { Ok(()) }
//! #     async fn send(&self, _t: &CancellationToken, batch: &[logsluice::LogEntry]) -> Result<(), logsluice::SinkError> {
//! #         for e in batch { println!("{}", e.message); }
//! #         Ok(())
//! #     }
//! #     fn is_healthy(&self) -> bool { true }
//! #     fn name(&self) -> &str { "stdout" }
//! # }
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let metrics = Arc::new(PipelineMetrics::new());
//!     let dispatcher = Dispatcher::new(PipelineConfig::default(), metrics)?;
//!     dispatcher.add_sink(Arc::new(StdoutSink))?;
//!
//!     let token = CancellationToken::new();
//!     dispatcher.start(token.clone()).await?;
//!
//!     dispatcher.handle(&token, "container", "web-0", "hello", &HashMap::new())?;
//!
//!     dispatcher.stop().await;
//!     Ok(())
//! }
//! ```

mod backoff;
mod backpressure;
mod breaker;
mod clock;
mod config;
mod dedup;
mod degrade;
mod dispatcher;
mod dlq;
mod entry;
mod error;
mod jitter;
mod metrics;
mod pool;
mod rate;
mod sink;
mod sleeper;
mod timestamp;
mod worker;

// Re-exports
pub use backoff::Backoff;
pub use backpressure::{
    BackpressureLevel, BackpressureMonitor, LoadSample, ManualProbe, NullProbe, ResourceProbe,
};
pub use breaker::{BreakerState, CircuitBreaker};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{
    BackpressureConfig, BackpressureWeights, BreakerConfig, ConfigError, DedupConfig,
    DegradeConfig, DlqConfig, HashAlgorithm, InvalidTimestampAction, PipelineConfig,
    RateLimitConfig, ReprocessConfig, TimestampConfig,
};
pub use dedup::{DedupCache, DedupStats};
pub use degrade::{DegradationController, Feature};
pub use dispatcher::{Dispatcher, StartError};
pub use dlq::{
    DeadLetterQueue, DlqEntry, DlqError, ReprocessCallback, ReprocessOutcome, Reprocessor,
};
pub use entry::{is_valid_label_key, FieldValue, LabelSet, LogEntry, MAX_LABEL_KEY_LEN};
pub use error::{ErrorKind, PipelineError, SinkError};
pub use jitter::Jitter;
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use pool::EntryPool;
pub use rate::AdaptiveRateLimiter;
pub use sink::{Sink, SinkStats};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use timestamp::{Disposition, TimestampPolicy, Verdict};

pub mod prelude;
