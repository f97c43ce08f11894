//! Convenience re-exports for typical pipeline wiring.
//!
//! ```rust
//! use logsluice::prelude::*;
//! ```

pub use crate::{
    BackpressureLevel, BreakerState, Dispatcher, ErrorKind, Feature, LabelSet, LogEntry,
    PipelineConfig, PipelineError, PipelineMetrics, Sink, SinkError, SinkStats, StartError,
};
pub use tokio_util::sync::CancellationToken;
