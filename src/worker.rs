//! Batch-forming worker loop and per-sink delivery.
//!
//! Each worker owns an accumulator: it pulls entries off the shared queue
//! and flushes when the batch fills, the batch timeout fires, or shutdown is
//! signaled. A flush fans out to every registered sink in parallel; each
//! sink gets its own retry loop behind its own circuit breaker, and
//! terminally failed batches are parked in the dead-letter queue. Entries go
//! back to the pool only after every sink has finished with them.

use crate::backoff::Backoff;
use crate::breaker::CircuitBreaker;
use crate::dlq::DeadLetterQueue;
use crate::entry::LogEntry;
use crate::error::{ErrorKind, PipelineError};
use crate::jitter::Jitter;
use crate::metrics::PipelineMetrics;
use crate::pool::EntryPool;
use crate::rate::AdaptiveRateLimiter;
use crate::sink::Sink;
use crate::sleeper::Sleeper;
use arc_swap::ArcSwap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// A registered sink plus its breaker.
#[derive(Clone)]
pub(crate) struct SinkEntry {
    pub(crate) sink: Arc<dyn Sink>,
    pub(crate) breaker: Arc<CircuitBreaker>,
}

/// Everything a worker needs, shared across the pool.
pub(crate) struct WorkerContext {
    pub(crate) queue: async_channel::Receiver<LogEntry>,
    pub(crate) sinks: Arc<ArcSwap<Vec<SinkEntry>>>,
    pub(crate) pool: Arc<EntryPool>,
    pub(crate) metrics: Arc<PipelineMetrics>,
    pub(crate) rate_limiter: Arc<AdaptiveRateLimiter>,
    pub(crate) dlq: Option<Arc<DeadLetterQueue>>,
    pub(crate) sleeper: Arc<dyn Sleeper>,
    pub(crate) batch_size: usize,
    pub(crate) batch_timeout: Duration,
    pub(crate) max_retries: u32,
    pub(crate) retry_backoff: Backoff,
    pub(crate) retry_jitter: Jitter,
    pub(crate) shutdown_grace: Duration,
}

/// One worker's main loop.
pub(crate) async fn run(ctx: Arc<WorkerContext>, worker_id: usize, token: CancellationToken) {
    let mut batch: Vec<LogEntry> = Vec::with_capacity(ctx.batch_size);
    let mut batch_deadline: Option<Instant> = None;

    tracing::debug!(worker_id, "worker started");
    loop {
        if batch.len() >= ctx.batch_size {
            flush(&ctx, &token, &mut batch).await;
            batch_deadline = None;
        }

        if batch.is_empty() {
            tokio::select! {
                _ = token.cancelled() => break,
                received = ctx.queue.recv() => match received {
                    Ok(entry) => {
                        batch_deadline = Some(Instant::now() + ctx.batch_timeout);
                        batch.push(entry);
                    }
                    Err(_) => break,
                },
            }
        } else {
            let deadline = batch_deadline.unwrap_or_else(Instant::now);
            tokio::select! {
                _ = token.cancelled() => break,
                received = ctx.queue.recv() => match received {
                    Ok(entry) => batch.push(entry),
                    Err(_) => break,
                },
                _ = tokio::time::sleep_until(deadline.into()) => {
                    flush(&ctx, &token, &mut batch).await;
                    batch_deadline = None;
                }
            }
        }
    }

    // Shutdown: drain the queue best-effort within the grace window.
    let drain_deadline = Instant::now() + ctx.shutdown_grace;
    while Instant::now() < drain_deadline {
        match ctx.queue.try_recv() {
            Ok(entry) => {
                batch.push(entry);
                if batch.len() >= ctx.batch_size {
                    flush(&ctx, &token, &mut batch).await;
                }
            }
            Err(_) => break,
        }
    }
    if !batch.is_empty() {
        flush(&ctx, &token, &mut batch).await;
    }
    tracing::debug!(worker_id, "worker stopped");
}

/// Deliver the accumulated batch to every sink, then recycle the entries.
async fn flush(ctx: &WorkerContext, token: &CancellationToken, batch: &mut Vec<LogEntry>) {
    if batch.is_empty() {
        return;
    }
    ctx.metrics.incr(&ctx.metrics.batches_flushed);

    let sinks = ctx.sinks.load_full();
    if !sinks.is_empty() {
        let deliveries = sinks
            .iter()
            .map(|sink_entry| deliver(ctx, token, sink_entry, batch.as_slice()));
        futures::future::join_all(deliveries).await;
    }

    ctx.metrics.add(&ctx.metrics.dispatched, batch.len() as u64);
    for entry in batch.drain(..) {
        ctx.pool.release(entry);
    }
}

/// Send one batch to one sink: retry with backoff behind the breaker, and
/// park in the DLQ when the batch cannot be delivered.
async fn deliver(
    ctx: &WorkerContext,
    token: &CancellationToken,
    sink_entry: &SinkEntry,
    batch: &[LogEntry],
) {
    let sink = sink_entry.sink.as_ref();
    let mut attempt: u32 = 0;

    loop {
        let started = Instant::now();
        let result = sink_entry.breaker.execute(sink.send(token, batch)).await;
        match result {
            Ok(()) => {
                ctx.rate_limiter.record_latency(started.elapsed());
                return;
            }
            Err(PipelineError::BreakerOpen { .. }) => {
                // The breaker opening already burned retries upstream; park
                // immediately without touching the sink.
                ctx.metrics.incr(&ctx.metrics.breaker_rejections);
                park(ctx, sink.name(), batch, ErrorKind::BreakerOpen, "circuit breaker open", attempt);
                return;
            }
            Err(PipelineError::Sink(sink_error)) => {
                ctx.metrics.incr(&ctx.metrics.sink_errors);
                if !sink_error.is_transient() {
                    park(
                        ctx,
                        sink.name(),
                        batch,
                        ErrorKind::Permanent,
                        sink_error.message(),
                        attempt,
                    );
                    return;
                }
                attempt += 1;
                if attempt > ctx.max_retries {
                    park(
                        ctx,
                        sink.name(),
                        batch,
                        ErrorKind::Transient,
                        sink_error.message(),
                        attempt - 1,
                    );
                    return;
                }
                ctx.metrics.incr(&ctx.metrics.retries);
                let delay = ctx.retry_jitter.apply(ctx.retry_backoff.delay(attempt));
                tracing::debug!(
                    sink = sink.name(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %sink_error,
                    "sink send failed, retrying"
                );
                tokio::select! {
                    _ = token.cancelled() => {
                        park(ctx, sink.name(), batch, ErrorKind::Transient, sink_error.message(), attempt - 1);
                        return;
                    }
                    _ = ctx.sleeper.sleep(delay) => {}
                }
            }
            Err(other) => {
                // The breaker surfaces only the variants above.
                tracing::error!(sink = sink.name(), error = %other, "unexpected delivery error");
                park(ctx, sink.name(), batch, ErrorKind::Unknown, &other.to_string(), attempt);
                return;
            }
        }
    }
}

/// Route a failed batch to the dead-letter queue, or count it lost.
fn park(
    ctx: &WorkerContext,
    sink_name: &str,
    batch: &[LogEntry],
    kind: ErrorKind,
    message: &str,
    retry_count: u32,
) {
    match &ctx.dlq {
        Some(dlq) => {
            for entry in batch {
                dlq.add_entry(entry, sink_name, kind, message, retry_count);
            }
        }
        None => {
            ctx.metrics.add(&ctx.metrics.dropped, batch.len() as u64);
            tracing::warn!(
                sink = sink_name,
                entries = batch.len(),
                kind = %kind,
                "dead-letter queue disabled, dropping failed batch"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{BreakerConfig, RateLimitConfig};
    use crate::error::SinkError;
    use crate::sleeper::TrackingSleeper;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted sink: pops one result per send, falls back to Ok.
    struct ScriptedSink {
        name: String,
        calls: AtomicUsize,
        script: Mutex<Vec<Result<(), SinkError>>>,
        batches: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedSink {
        fn new(name: &str, script: Vec<Result<(), SinkError>>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                calls: AtomicUsize::new(0),
                script: Mutex::new(script),
                batches: Mutex::new(Vec::new()),
            })
        }

        fn always_transient(name: &str) -> Arc<Self> {
            Self::new(name, Vec::new())
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Sink for ScriptedSink {
        async fn start(&self, _token: CancellationToken) -> Result<(), SinkError> {
            Ok(())
        }

        async fn stop(&self) -> Result<(), SinkError> {
            Ok(())
        }

        async fn send(
            &self,
            _token: &CancellationToken,
            batch: &[LogEntry],
        ) -> Result<(), SinkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.batches
                .lock()
                .unwrap()
                .push(batch.iter().map(|e| e.message.clone()).collect());
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                // Empty script means: always fail transiently. Tests that
                // want success push explicit Ok results.
                if self.name.starts_with("flaky") {
                    Err(SinkError::transient("scripted failure"))
                } else {
                    Ok(())
                }
            } else {
                script.remove(0)
            }
        }

        fn is_healthy(&self) -> bool {
            true
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    fn context(sinks: Vec<SinkEntry>, max_retries: u32) -> (Arc<WorkerContext>, TrackingSleeper) {
        let sleeper = TrackingSleeper::new();
        let (_tx, rx) = async_channel::bounded(16);
        let ctx = Arc::new(WorkerContext {
            queue: rx,
            sinks: Arc::new(ArcSwap::from_pointee(sinks)),
            pool: Arc::new(EntryPool::new(16)),
            metrics: Arc::new(PipelineMetrics::new()),
            rate_limiter: Arc::new(AdaptiveRateLimiter::new(
                RateLimitConfig::default(),
                Arc::new(ManualClock::new()),
            )),
            dlq: None,
            sleeper: Arc::new(sleeper.clone()),
            batch_size: 4,
            batch_timeout: Duration::from_millis(50),
            max_retries,
            retry_backoff: Backoff::exponential(
                Duration::from_millis(10),
                Duration::from_secs(1),
            ),
            retry_jitter: Jitter::None,
            shutdown_grace: Duration::from_millis(100),
        });
        (ctx, sleeper)
    }

    fn sink_entry(sink: Arc<ScriptedSink>) -> SinkEntry {
        let breaker = Arc::new(CircuitBreaker::new(
            sink.name().to_string(),
            BreakerConfig::default(),
            Arc::new(ManualClock::new()),
        ));
        SinkEntry { sink, breaker }
    }

    fn batch(messages: &[&str]) -> Vec<LogEntry> {
        messages
            .iter()
            .map(|m| LogEntry::new("container", "c-1", *m))
            .collect()
    }

    #[tokio::test]
    async fn successful_delivery_records_latency_and_recycles() {
        let sink = ScriptedSink::new("ok", vec![]);
        let (ctx, _) = context(vec![sink_entry(sink.clone())], 3);
        let token = CancellationToken::new();

        let mut entries = batch(&["a", "b"]);
        flush(&ctx, &token, &mut entries).await;

        assert!(entries.is_empty());
        assert_eq!(sink.calls(), 1);
        assert_eq!(ctx.pool.retained(), 2, "entries returned to the pool");
        let snap = ctx.metrics.snapshot();
        assert_eq!(snap.dispatched, 2);
        assert_eq!(snap.batches_flushed, 1);
        assert!(ctx.rate_limiter.average_latency() > Duration::ZERO);
    }

    #[tokio::test]
    async fn transient_failures_retry_with_exponential_backoff() {
        let sink = ScriptedSink::new(
            "wobbly",
            vec![
                Err(SinkError::transient("one")),
                Err(SinkError::transient("two")),
                Ok(()),
            ],
        );
        let (ctx, sleeper) = context(vec![sink_entry(sink.clone())], 3);
        let token = CancellationToken::new();

        let mut entries = batch(&["a"]);
        flush(&ctx, &token, &mut entries).await;

        assert_eq!(sink.calls(), 3);
        assert_eq!(
            sleeper.calls(),
            vec![Duration::from_millis(10), Duration::from_millis(20)]
        );
        assert_eq!(ctx.metrics.snapshot().retries, 2);
    }

    #[tokio::test]
    async fn permanent_failure_skips_retries() {
        let sink = ScriptedSink::new("strict", vec![Err(SinkError::permanent("bad payload"))]);
        let (ctx, sleeper) = context(vec![sink_entry(sink.clone())], 5);
        let token = CancellationToken::new();

        let mut entries = batch(&["a"]);
        flush(&ctx, &token, &mut entries).await;

        assert_eq!(sink.calls(), 1, "no retries for permanent errors");
        assert!(sleeper.calls().is_empty());
        assert_eq!(ctx.metrics.snapshot().dropped, 1, "no DLQ configured");
    }

    #[tokio::test]
    async fn one_sink_failing_does_not_block_the_other() {
        let good = ScriptedSink::new("good", vec![]);
        let bad = ScriptedSink::always_transient("flaky");
        let (ctx, _) = context(
            vec![sink_entry(good.clone()), sink_entry(bad.clone())],
            1,
        );
        let token = CancellationToken::new();

        let mut entries = batch(&["x"]);
        flush(&ctx, &token, &mut entries).await;

        assert_eq!(good.calls(), 1);
        assert_eq!(bad.calls(), 2, "initial + one retry");
        assert_eq!(ctx.metrics.snapshot().dropped, 1, "only the failing sink parks");
        assert_eq!(ctx.pool.retained(), 1, "entry released after both sinks finish");
    }

    #[tokio::test]
    async fn worker_flushes_on_batch_timeout() {
        let sink = ScriptedSink::new("ok", vec![]);
        let (tx, rx) = async_channel::bounded(16);
        let (template, _) = context(vec![sink_entry(sink.clone())], 1);
        let ctx = Arc::new(WorkerContext {
            queue: rx,
            sinks: template.sinks.clone(),
            pool: template.pool.clone(),
            metrics: template.metrics.clone(),
            rate_limiter: template.rate_limiter.clone(),
            dlq: None,
            sleeper: template.sleeper.clone(),
            batch_size: 100,
            batch_timeout: Duration::from_millis(30),
            max_retries: 1,
            retry_backoff: template.retry_backoff.clone(),
            retry_jitter: Jitter::None,
            shutdown_grace: Duration::from_millis(100),
        });

        let token = CancellationToken::new();
        let worker = tokio::spawn(run(ctx, 0, token.clone()));

        tx.send(LogEntry::new("t", "s", "only")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(sink.calls(), 1, "partial batch flushed by timeout");

        token.cancel();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn worker_drains_queue_on_shutdown() {
        let sink = ScriptedSink::new("ok", vec![]);
        let (tx, rx) = async_channel::bounded(16);
        let (template, _) = context(vec![sink_entry(sink.clone())], 1);
        let ctx = Arc::new(WorkerContext {
            queue: rx,
            sinks: template.sinks.clone(),
            pool: template.pool.clone(),
            metrics: template.metrics.clone(),
            rate_limiter: template.rate_limiter.clone(),
            dlq: None,
            sleeper: template.sleeper.clone(),
            batch_size: 2,
            batch_timeout: Duration::from_secs(10),
            max_retries: 1,
            retry_backoff: template.retry_backoff.clone(),
            retry_jitter: Jitter::None,
            shutdown_grace: Duration::from_millis(500),
        });

        for i in 0..5 {
            tx.try_send(LogEntry::new("t", "s", format!("m{i}"))).unwrap();
        }
        let token = CancellationToken::new();
        token.cancel();
        run(ctx.clone(), 0, token).await;

        let snap = ctx.metrics.snapshot();
        assert_eq!(snap.dispatched, 5, "drained everything before exiting");
    }
}
