//! Process-wide pipeline counters.
//!
//! One `PipelineMetrics` instance is created at wiring time and injected
//! `Arc`-shared into every component. Tests construct their own instance,
//! so nothing here is a global.

use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        /// Monotonic counters for everything the pipeline counts.
        #[derive(Debug, Default)]
        pub struct PipelineMetrics {
            $($(#[$doc])* pub $name: AtomicU64,)*
        }

        /// Point-in-time copy of every counter.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct MetricsSnapshot {
            $(pub $name: u64,)*
        }

        impl PipelineMetrics {
            pub fn new() -> Self {
                Self::default()
            }

            pub fn snapshot(&self) -> MetricsSnapshot {
                MetricsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    /// Entries offered to `handle`.
    received,
    /// Entries delivered to every registered sink.
    dispatched,
    /// Batches flushed by workers.
    batches_flushed,
    /// `handle` calls rejected because the ingress queue was full.
    queue_full,
    /// `handle` calls denied by the rate limiter.
    throttled,
    /// `handle` calls rejected under critical backpressure.
    overload_rejections,
    /// Entries suppressed by the dedup cache.
    duplicates,
    /// Batches diverted because a sink's breaker was open.
    breaker_rejections,
    /// Individual sink send retries.
    retries,
    /// Failed sink sends (before retry accounting).
    sink_errors,
    /// Entries parked in the dead-letter queue.
    dlq_entries,
    /// Entries lost because the DLQ could not accept or persist them.
    dlq_write_errors,
    /// DLQ entries successfully replayed.
    dlq_reprocessed,
    /// Entries terminally dropped without reaching a sink or the DLQ.
    dropped,
    /// Timestamps clamped forward from the past edge of the window.
    clamped_past,
    /// Timestamps clamped back from the future edge of the window.
    clamped_future,
    /// Entries dropped by timestamp action `reject`.
    rejected_timestamps,
    /// Entries abandoned in the queue when the drain grace expired.
    shutdown_drops,
}

impl PipelineMetrics {
    /// Bump a counter by one.
    pub(crate) fn incr(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Bump a counter by `n`.
    pub(crate) fn add(&self, counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let metrics = PipelineMetrics::new();
        metrics.incr(&metrics.received);
        metrics.incr(&metrics.received);
        metrics.add(&metrics.dlq_entries, 5);

        let snap = metrics.snapshot();
        assert_eq!(snap.received, 2);
        assert_eq!(snap.dlq_entries, 5);
        assert_eq!(snap.queue_full, 0);
    }

    #[test]
    fn instances_are_isolated() {
        let a = PipelineMetrics::new();
        let b = PipelineMetrics::new();
        a.incr(&a.dropped);
        assert_eq!(a.snapshot().dropped, 1);
        assert_eq!(b.snapshot().dropped, 0);
    }
}
