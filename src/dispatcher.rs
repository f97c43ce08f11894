//! The central ingress, queue, and worker pool.
//!
//! `handle` applies the admission policy (shutdown, rate limit,
//! backpressure, timestamp hygiene, dedup) and then attempts a non-blocking
//! enqueue. Workers pull from the shared bounded queue, form batches, and
//! deliver to every registered sink. Start wires up and spawns the whole
//! background task population; stop tears it down and waits for it.

use crate::backoff::Backoff;
use crate::backpressure::{
    BackpressureLevel, BackpressureMonitor, LoadSample, NullProbe, ResourceProbe,
};
use crate::breaker::{BreakerState, CircuitBreaker};
use crate::clock::{Clock, MonotonicClock};
use crate::config::{ConfigError, PipelineConfig};
use crate::dedup::DedupCache;
use crate::degrade::{DegradationController, Feature};
use crate::dlq::{DeadLetterQueue, DlqError, ReprocessCallback, Reprocessor};
use crate::entry::{LabelSet, LogEntry};
use crate::error::{ErrorKind, PipelineError, SinkError};
use crate::metrics::PipelineMetrics;
use crate::pool::EntryPool;
use crate::rate::AdaptiveRateLimiter;
use crate::sink::Sink;
use crate::sleeper::TokioSleeper;
use crate::timestamp::{Disposition, TimestampPolicy};
use crate::worker::{self, SinkEntry, WorkerContext};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Errors surfaced by [`Dispatcher::start`].
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("dispatcher already started")]
    AlreadyStarted,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("dead-letter queue initialization failed: {0}")]
    Dlq(#[from] DlqError),
    #[error("sink {name} failed to start: {source}")]
    Sink { name: String, source: SinkError },
}

struct RunState {
    token: Option<CancellationToken>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
    dlq: Option<Arc<DeadLetterQueue>>,
}

/// The pipeline's front door and owner of its background tasks.
pub struct Dispatcher {
    config: PipelineConfig,
    metrics: Arc<PipelineMetrics>,
    clock: Arc<dyn Clock>,
    pool: Arc<EntryPool>,
    queue_tx: async_channel::Sender<LogEntry>,
    queue_rx: async_channel::Receiver<LogEntry>,
    sinks: Arc<ArcSwap<Vec<SinkEntry>>>,
    /// Serializes sink registration after start.
    sink_mutation: Mutex<()>,
    rate_limiter: Arc<AdaptiveRateLimiter>,
    dedup: Arc<DedupCache>,
    backpressure: Arc<BackpressureMonitor>,
    degradation: Arc<DegradationController>,
    timestamp_policy: TimestampPolicy,
    probe: Arc<dyn ResourceProbe>,
    started: AtomicBool,
    stopping: AtomicBool,
    run_state: tokio::sync::Mutex<RunState>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("queue_len", &self.queue_len())
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        config: PipelineConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<Self, ConfigError> {
        Self::with_probe(config, metrics, Arc::new(NullProbe))
    }

    /// Build with an injected memory/CPU/IO probe.
    pub fn with_probe(
        config: PipelineConfig,
        metrics: Arc<PipelineMetrics>,
        probe: Arc<dyn ResourceProbe>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::default());
        let (queue_tx, queue_rx) = async_channel::bounded(config.queue_size);

        let rate_limiter = Arc::new(AdaptiveRateLimiter::new(
            config.rate_limit.clone(),
            clock.clone(),
        ));
        let dedup = Arc::new(DedupCache::new(config.dedup.clone(), clock.clone()));
        let backpressure = Arc::new(BackpressureMonitor::new(
            config.backpressure.clone(),
            clock.clone(),
        ));
        let degradation = Arc::new(DegradationController::new(
            config.degrade.clone(),
            clock.clone(),
        ));

        // Level changes fan out: feature shedding and admission scaling.
        {
            let degradation = degradation.clone();
            let rate_limiter = rate_limiter.clone();
            let factors = config.backpressure.admission_factors;
            backpressure.on_change(move |old, new| {
                degradation.on_level_change(old, new);
                rate_limiter.set_admission_factor(factors[new.index()]);
            });
        }

        Ok(Self {
            timestamp_policy: TimestampPolicy::new(config.timestamp.clone()),
            pool: Arc::new(EntryPool::new(config.pool_retain)),
            metrics,
            clock,
            queue_tx,
            queue_rx,
            sinks: Arc::new(ArcSwap::from_pointee(Vec::new())),
            sink_mutation: Mutex::new(()),
            rate_limiter,
            dedup,
            backpressure,
            degradation,
            probe,
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            run_state: tokio::sync::Mutex::new(RunState {
                token: None,
                handles: Vec::new(),
                dlq: None,
            }),
            config,
        })
    }

    /// Register a sink. Before start this is plain bookkeeping; after start
    /// the swap is serialized and visible to subsequent batches only.
    pub fn add_sink(&self, sink: Arc<dyn Sink>) -> Result<(), ConfigError> {
        if sink.ordered() && self.config.workers != 1 {
            return Err(ConfigError::Invalid {
                field: "workers",
                reason: format!(
                    "sink {} requires ordering, which needs a single worker",
                    sink.name()
                ),
            });
        }
        let _guard = self
            .sink_mutation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let breaker = Arc::new(CircuitBreaker::new(
            sink.name().to_string(),
            self.config.breaker.clone(),
            self.clock.clone(),
        ));
        let mut sinks = self.sinks.load().as_ref().clone();
        tracing::info!(sink = sink.name(), "sink registered");
        sinks.push(SinkEntry { sink, breaker });
        self.sinks.store(Arc::new(sinks));
        Ok(())
    }

    /// Spawn workers and the background task population. Fails without side
    /// effects on double start; sink start failures abort the whole start.
    pub async fn start(&self, parent: CancellationToken) -> Result<(), StartError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(StartError::AlreadyStarted);
        }
        self.stopping.store(false, Ordering::SeqCst);
        let token = parent.child_token();

        // Fatal start-up work first: DLQ directory, then sinks.
        let dlq = if self.config.dlq.enabled {
            match DeadLetterQueue::open(self.config.dlq.clone(), self.metrics.clone()).await {
                Ok(dlq) => Some(dlq),
                Err(e) => {
                    self.started.store(false, Ordering::SeqCst);
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        let sinks = self.sinks.load_full();
        let mut started_sinks: Vec<&SinkEntry> = Vec::new();
        for sink_entry in sinks.iter() {
            if let Err(source) = sink_entry.sink.start(token.clone()).await {
                for started in started_sinks {
                    let _ = started.sink.stop().await;
                }
                self.started.store(false, Ordering::SeqCst);
                return Err(StartError::Sink {
                    name: sink_entry.sink.name().to_string(),
                    source,
                });
            }
            started_sinks.push(sink_entry);
        }

        let mut state = self.run_state.lock().await;
        state.token = Some(token.clone());
        state.dlq = dlq.clone();

        let ctx = Arc::new(WorkerContext {
            queue: self.queue_rx.clone(),
            sinks: self.sinks.clone(),
            pool: self.pool.clone(),
            metrics: self.metrics.clone(),
            rate_limiter: self.rate_limiter.clone(),
            dlq: dlq.clone(),
            sleeper: Arc::new(TokioSleeper),
            batch_size: self.config.batch_size,
            batch_timeout: self.config.batch_timeout(),
            max_retries: self.config.max_retries,
            retry_backoff: Backoff::exponential(
                self.config.retry_base_delay(),
                self.config.retry_max_delay(),
            ),
            retry_jitter: self.config.retry_jitter,
            shutdown_grace: self.config.shutdown_grace(),
        });

        for worker_id in 0..self.config.workers {
            let handle = tokio::spawn(worker::run(ctx.clone(), worker_id, token.clone()));
            state.handles.push(("worker", handle));
        }

        if let Some(dlq) = &dlq {
            state.handles.push(("dlq-writer", dlq.spawn_writer(token.clone())?));
            state.handles.push(("dlq-retention", dlq.spawn_retention(token.clone())));
            if self.config.dlq.reprocessing.enabled {
                let reprocessor = Reprocessor::new(
                    dlq.clone(),
                    self.config.dlq.reprocessing.clone(),
                    self.reprocess_callback(token.clone()),
                );
                state.handles.push(("dlq-reprocessor", reprocessor.spawn(token.clone())));
            }
        }

        if self.config.dedup.enabled {
            state.handles.push(("dedup-cleanup", self.dedup.spawn_cleanup(token.clone())));
        }
        if self.config.rate_limit.enabled {
            state
                .handles
                .push(("rate-adaptation", self.rate_limiter.spawn_adaptation(token.clone())));
        }
        state.handles.push(("backpressure-sampler", self.spawn_sampler(token.clone())));
        state.handles.push(("metrics-updater", self.spawn_metrics_updater(token.clone())));

        tracing::info!(
            workers = self.config.workers,
            queue_size = self.config.queue_size,
            sinks = sinks.len(),
            "dispatcher started"
        );
        Ok(())
    }

    /// Cancel, drain within the grace window, join every tracked task, then
    /// stop the sinks. Safe to call more than once.
    pub async fn stop(&self) {
        if !self.started.load(Ordering::SeqCst) {
            return;
        }
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }

        let (token, handles, dlq) = {
            let mut state = self.run_state.lock().await;
            (
                state.token.take(),
                std::mem::take(&mut state.handles),
                state.dlq.take(),
            )
        };
        if let Some(token) = token {
            token.cancel();
        }

        let join_budget = self.config.shutdown_grace() * 2;
        for (name, handle) in handles {
            match tokio::time::timeout(join_budget, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(task = name, error = %e, "background task panicked"),
                Err(_) => tracing::warn!(task = name, "background task did not stop in time"),
            }
        }

        // Anything still queued after the drain grace is lost; say so.
        let mut abandoned = 0u64;
        while let Ok(entry) = self.queue_rx.try_recv() {
            self.pool.release(entry);
            abandoned += 1;
        }
        if abandoned > 0 {
            self.metrics.add(&self.metrics.shutdown_drops, abandoned);
            tracing::warn!(abandoned, "entries abandoned at shutdown");
        }
        drop(dlq);

        for sink_entry in self.sinks.load_full().iter() {
            if let Err(e) = sink_entry.sink.stop().await {
                tracing::warn!(sink = sink_entry.sink.name(), error = %e, "sink stop failed");
            }
        }

        self.started.store(false, Ordering::SeqCst);
        tracing::info!("dispatcher stopped");
    }

    /// Admission-check and enqueue one message. Never blocks.
    pub fn handle(
        &self,
        token: &CancellationToken,
        source_type: &str,
        source_id: &str,
        message: &str,
        labels: &HashMap<String, String>,
    ) -> Result<(), PipelineError> {
        self.metrics.incr(&self.metrics.received);
        self.admission_check(token)?;

        // Dedup sits after rate limiting and before enqueue.
        let now = SystemTime::now();
        let source_id = if source_id.is_empty() { "unknown" } else { source_id };
        if self.dedup_active() && self.dedup.is_duplicate(source_id, message, now) {
            self.metrics.incr(&self.metrics.duplicates);
            return Ok(());
        }

        let mut entry = self.pool.acquire();
        entry.timestamp = now;
        entry.source_type.push_str(source_type);
        entry.source_id.push_str(source_id);
        entry.message.push_str(message);
        // The producer keeps its map; we copy into a fresh label set.
        entry.labels = LabelSet::from_map(labels);

        self.enqueue(entry)
    }

    /// Admission-check and enqueue a caller-built entry.
    pub fn handle_entry(
        &self,
        token: &CancellationToken,
        mut entry: LogEntry,
    ) -> Result<(), PipelineError> {
        self.metrics.incr(&self.metrics.received);
        self.admission_check(token)?;

        if entry.source_id.is_empty() {
            entry.source_id.push_str("unknown");
        }

        let now = SystemTime::now();
        let verdict = self.timestamp_policy.apply(entry.timestamp, now);
        match verdict.disposition {
            Disposition::Valid | Disposition::Warned => {}
            Disposition::Rejected => {
                self.metrics.incr(&self.metrics.rejected_timestamps);
                self.metrics.incr(&self.metrics.dropped);
                return Err(PipelineError::InvalidTimestamp);
            }
            Disposition::ClampedPast | Disposition::ClampedFuture => {
                if verdict.disposition == Disposition::ClampedPast {
                    self.metrics.incr(&self.metrics.clamped_past);
                } else {
                    self.metrics.incr(&self.metrics.clamped_future);
                }
                if self.timestamp_policy.clamp_to_dlq() {
                    if let Some(dlq) = self.current_dlq() {
                        dlq.add_entry(
                            &entry,
                            "",
                            ErrorKind::InvalidTimestamp,
                            "timestamp clamped into validity window",
                            0,
                        );
                    }
                }
                entry.timestamp = verdict.timestamp;
            }
        }

        if self.dedup_active()
            && self
                .dedup
                .is_duplicate(&entry.source_id, &entry.message, entry.timestamp)
        {
            self.metrics.incr(&self.metrics.duplicates);
            self.pool.release(entry);
            return Ok(());
        }

        self.enqueue(entry)
    }

    fn admission_check(&self, token: &CancellationToken) -> Result<(), PipelineError> {
        if token.is_cancelled() || self.stopping.load(Ordering::SeqCst) {
            return Err(PipelineError::Shutdown);
        }
        if let Err(wait) = self.rate_limiter.allow() {
            self.metrics.incr(&self.metrics.throttled);
            return Err(PipelineError::Throttled { wait });
        }
        let level = self.backpressure.level();
        if level >= BackpressureLevel::Critical {
            self.metrics.incr(&self.metrics.overload_rejections);
            return Err(PipelineError::Rejected { level });
        }
        Ok(())
    }

    fn enqueue(&self, entry: LogEntry) -> Result<(), PipelineError> {
        match self.queue_tx.try_send(entry) {
            Ok(()) => Ok(()),
            Err(async_channel::TrySendError::Full(entry)) => {
                self.pool.release(entry);
                self.metrics.incr(&self.metrics.queue_full);
                Err(PipelineError::QueueFull { capacity: self.config.queue_size })
            }
            Err(async_channel::TrySendError::Closed(entry)) => {
                self.pool.release(entry);
                Err(PipelineError::Shutdown)
            }
        }
    }

    fn dedup_active(&self) -> bool {
        self.config.dedup.enabled && self.degradation.is_enabled(Feature::Deduplication)
    }

    fn current_dlq(&self) -> Option<Arc<DeadLetterQueue>> {
        self.run_state.try_lock().ok().and_then(|state| state.dlq.clone())
    }

    /// Replays dead-lettered entries against their original sink, through
    /// the same breaker the live path uses.
    fn reprocess_callback(&self, token: CancellationToken) -> ReprocessCallback {
        let sinks = self.sinks.clone();
        Arc::new(move |dlq_entry| {
            let sinks = sinks.load_full();
            let token = token.clone();
            Box::pin(async move {
                let target = sinks
                    .iter()
                    .find(|s| s.sink.name() == dlq_entry.failed_sink)
                    .cloned();
                match target {
                    Some(sink_entry) => {
                        let batch = std::slice::from_ref(&dlq_entry.original_entry);
                        sink_entry
                            .breaker
                            .execute(sink_entry.sink.send(&token, batch))
                            .await
                            .map_err(|e| match e {
                                PipelineError::Sink(sink_error) => sink_error,
                                other => SinkError::transient(other.to_string()),
                            })
                    }
                    None => Err(SinkError::permanent(format!(
                        "sink {} is no longer registered",
                        dlq_entry.failed_sink
                    ))),
                }
            })
        })
    }

    fn spawn_sampler(&self, token: CancellationToken) -> JoinHandle<()> {
        let backpressure = self.backpressure.clone();
        let degradation = self.degradation.clone();
        let probe = self.probe.clone();
        let metrics = self.metrics.clone();
        let queue_rx = self.queue_rx.clone();
        let capacity = self.config.queue_size as f64;
        let interval = self.config.backpressure.sample_interval();
        tokio::spawn(async move {
            let mut prev = metrics.snapshot();
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let snap = metrics.snapshot();
                        let attempts = (snap.dispatched + snap.sink_errors)
                            .saturating_sub(prev.dispatched + prev.sink_errors);
                        let errors = snap.sink_errors.saturating_sub(prev.sink_errors);
                        let error_rate = if attempts == 0 {
                            0.0
                        } else {
                            errors as f64 / attempts as f64
                        };
                        prev = snap;

                        let sample = LoadSample {
                            queue: queue_rx.len() as f64 / capacity,
                            memory: probe.memory(),
                            cpu: probe.cpu(),
                            io: probe.io(),
                            error_rate,
                        };
                        backpressure.observe(&sample);
                        degradation.tick();
                    }
                }
            }
        })
    }

    fn spawn_metrics_updater(&self, token: CancellationToken) -> JoinHandle<()> {
        let metrics = self.metrics.clone();
        let degradation = self.degradation.clone();
        let queue_rx = self.queue_rx.clone();
        let pool = self.pool.clone();
        tokio::spawn(async move {
            let interval = std::time::Duration::from_secs(10);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        if degradation.is_enabled(Feature::DetailedMetrics) {
                            let snap = metrics.snapshot();
                            tracing::debug!(
                                queue_len = queue_rx.len(),
                                pool_retained = pool.retained(),
                                received = snap.received,
                                dispatched = snap.dispatched,
                                dlq_entries = snap.dlq_entries,
                                "pipeline counters"
                            );
                        }
                    }
                }
            }
        })
    }

    // Introspection, mostly for tests and operators.

    pub fn queue_len(&self) -> usize {
        self.queue_rx.len()
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    pub fn backpressure(&self) -> &BackpressureMonitor {
        &self.backpressure
    }

    pub fn degradation(&self) -> &DegradationController {
        &self.degradation
    }

    pub fn rate_limiter(&self) -> &AdaptiveRateLimiter {
        &self.rate_limiter
    }

    pub fn dedup_cache(&self) -> &DedupCache {
        &self.dedup
    }

    /// Breaker state for a registered sink.
    pub fn breaker_state(&self, sink_name: &str) -> Option<BreakerState> {
        self.sinks
            .load()
            .iter()
            .find(|s| s.sink.name() == sink_name)
            .map(|s| s.breaker.state())
    }
}
