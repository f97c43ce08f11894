//! The downstream sink contract.
//!
//! Concrete sinks (HTTP, object store, local file) live with the embedding
//! binary; the pipeline only needs this trait.

use crate::entry::LogEntry;
use crate::error::SinkError;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Counters a sink may expose about itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub sent_batches: u64,
    pub sent_entries: u64,
    pub errors: u64,
}

/// Downstream consumer of batches.
///
/// `send` must tolerate concurrent invocation unless [`Sink::ordered`]
/// returns true, and must honor the cancellation token: it is the only
/// unbounded wait in the pipeline.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn start(&self, token: CancellationToken) -> Result<(), SinkError>;

    async fn stop(&self) -> Result<(), SinkError>;

    async fn send(&self, token: &CancellationToken, batch: &[LogEntry]) -> Result<(), SinkError>;

    fn is_healthy(&self) -> bool;

    fn name(&self) -> &str;

    /// Sinks that need strict FIFO must return true; the dispatcher then
    /// insists on a single worker.
    fn ordered(&self) -> bool {
        false
    }

    /// Fill level of the sink's own internal buffer, `0..=1`.
    fn queue_utilization(&self) -> f64 {
        0.0
    }

    fn stats(&self) -> SinkStats {
        SinkStats::default()
    }
}
