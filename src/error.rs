//! Error types for the pipeline.

use crate::backpressure::BackpressureLevel;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Classification persisted with dead-lettered entries and used by the retry
/// loop to decide between retrying and parking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network/timeout/5xx class failures, worth retrying.
    Transient,
    /// Invalid payload/auth/4xx class failures, never retried.
    Permanent,
    /// The sink's circuit breaker was open when the batch arrived.
    BreakerOpen,
    /// Timestamp outside the validity window with action `reject`.
    InvalidTimestamp,
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::BreakerOpen => "breaker_open",
            Self::InvalidTimestamp => "invalid_timestamp",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Error returned by a sink's `send`, carrying its retry classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkError {
    kind: ErrorKind,
    message: String,
}

impl SinkError {
    /// A failure worth retrying (network, timeout, 5xx).
    pub fn transient(message: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Transient, message: message.into() }
    }

    /// A failure retrying cannot fix (invalid payload, auth, 4xx).
    pub fn permanent(message: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Permanent, message: message.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sink error: {}", self.kind, self.message)
    }
}

impl std::error::Error for SinkError {}

/// Unified error type surfaced by the dispatcher and its collaborators.
#[derive(Debug)]
pub enum PipelineError {
    /// The bounded ingress queue was full.
    QueueFull { capacity: usize },
    /// The rate limiter denied admission.
    Throttled { wait: Duration },
    /// Backpressure reached a level that rejects new entries.
    Rejected { level: BackpressureLevel },
    /// The pipeline is shutting down.
    Shutdown,
    /// The sink's circuit breaker is open.
    BreakerOpen { failures: usize },
    /// The sink itself failed.
    Sink(SinkError),
    /// Timestamp outside the validity window with action `reject`.
    InvalidTimestamp,
    /// The entry could not be persisted to the dead-letter queue.
    DlqWrite(String),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull { capacity } => {
                write!(f, "ingress queue full (capacity {})", capacity)
            }
            Self::Throttled { wait } => {
                write!(f, "rate limit exceeded, retry after {:?}", wait)
            }
            Self::Rejected { level } => {
                write!(f, "rejected under backpressure (level {})", level)
            }
            Self::Shutdown => f.write_str("pipeline shutting down"),
            Self::BreakerOpen { failures } => {
                write!(f, "circuit breaker open ({} consecutive failures)", failures)
            }
            Self::Sink(e) => write!(f, "{}", e),
            Self::InvalidTimestamp => f.write_str("timestamp outside validity window"),
            Self::DlqWrite(msg) => write!(f, "dead-letter write failed: {}", msg),
        }
    }
}

impl PipelineError {
    /// Error kind recorded on DLQ lines for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Sink(e) => e.kind(),
            Self::BreakerOpen { .. } => ErrorKind::BreakerOpen,
            Self::InvalidTimestamp => ErrorKind::InvalidTimestamp,
            _ => ErrorKind::Unknown,
        }
    }

    pub fn is_queue_full(&self) -> bool {
        matches!(self, Self::QueueFull { .. })
    }

    pub fn is_throttled(&self) -> bool {
        matches!(self, Self::Throttled { .. })
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }

    pub fn is_breaker_open(&self) -> bool {
        matches!(self, Self::BreakerOpen { .. })
    }

    pub fn is_invalid_timestamp(&self) -> bool {
        matches!(self, Self::InvalidTimestamp)
    }

    /// Borrow the sink error if present.
    pub fn as_sink(&self) -> Option<&SinkError> {
        match self {
            Self::Sink(e) => Some(e),
            _ => None,
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Sink(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SinkError> for PipelineError {
    fn from(e: SinkError) -> Self {
        Self::Sink(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_error_classification() {
        let t = SinkError::transient("connection reset");
        assert!(t.is_transient());
        assert_eq!(t.kind(), ErrorKind::Transient);

        let p = SinkError::permanent("401 unauthorized");
        assert!(!p.is_transient());
        assert_eq!(p.kind(), ErrorKind::Permanent);
    }

    #[test]
    fn pipeline_error_kind_maps_to_dlq_taxonomy() {
        assert_eq!(
            PipelineError::Sink(SinkError::transient("x")).kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            PipelineError::BreakerOpen { failures: 5 }.kind(),
            ErrorKind::BreakerOpen
        );
        assert_eq!(
            PipelineError::InvalidTimestamp.kind(),
            ErrorKind::InvalidTimestamp
        );
        assert_eq!(PipelineError::Shutdown.kind(), ErrorKind::Unknown);
    }

    #[test]
    fn display_messages_name_the_condition() {
        let msg = PipelineError::QueueFull { capacity: 8 }.to_string();
        assert!(msg.contains("queue full"));
        assert!(msg.contains('8'));

        let msg = PipelineError::Throttled { wait: Duration::from_millis(50) }.to_string();
        assert!(msg.contains("rate limit"));

        let msg = PipelineError::BreakerOpen { failures: 3 }.to_string();
        assert!(msg.contains("circuit breaker"));
    }

    #[test]
    fn error_kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ErrorKind::BreakerOpen).unwrap(),
            "\"breaker_open\""
        );
        let kind: ErrorKind = serde_json::from_str("\"transient\"").unwrap();
        assert_eq!(kind, ErrorKind::Transient);
    }

    #[test]
    fn predicates_cover_variants() {
        assert!(PipelineError::QueueFull { capacity: 1 }.is_queue_full());
        assert!(PipelineError::Shutdown.is_shutdown());
        assert!(PipelineError::InvalidTimestamp.is_invalid_timestamp());
        assert!(PipelineError::Throttled { wait: Duration::ZERO }.is_throttled());
        assert!(PipelineError::Rejected { level: BackpressureLevel::Critical }.is_rejected());
    }
}
