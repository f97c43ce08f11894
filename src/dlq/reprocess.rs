//! Bounded replay of dead-lettered entries.
//!
//! Each round collects eligible entries, replays them through the
//! registered callback, and rewrites the touched files: successes vanish,
//! failures stay with a pushed-out next-attempt time.

use super::{DeadLetterQueue, DlqEntry};
use crate::backoff::Backoff;
use crate::config::ReprocessConfig;
use crate::error::SinkError;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Callback replaying one entry against the sink named by its
/// `failed_sink` field.
pub type ReprocessCallback =
    Arc<dyn Fn(DlqEntry) -> BoxFuture<'static, Result<(), SinkError>> + Send + Sync>;

/// What one reprocessing round did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReprocessOutcome {
    pub scanned: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Periodic DLQ replayer.
pub struct Reprocessor {
    dlq: Arc<DeadLetterQueue>,
    config: ReprocessConfig,
    callback: ReprocessCallback,
}

impl std::fmt::Debug for Reprocessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reprocessor")
            .field("interval_secs", &self.config.interval_secs)
            .finish_non_exhaustive()
    }
}

impl Reprocessor {
    pub fn new(
        dlq: Arc<DeadLetterQueue>,
        config: ReprocessConfig,
        callback: ReprocessCallback,
    ) -> Self {
        Self { dlq, config, callback }
    }

    fn eligible(&self, entry: &DlqEntry, now: SystemTime) -> bool {
        if entry.reprocess_attempts >= self.config.max_retries {
            return false;
        }
        if now < entry.next_reprocess_time {
            return false;
        }
        match now.duration_since(entry.timestamp) {
            Ok(age) => age >= self.config.min_entry_age(),
            Err(_) => false,
        }
    }

    fn push_out(&self, entry: &mut DlqEntry, now: SystemTime) {
        entry.reprocess_attempts += 1;
        let backoff = Backoff::geometric(
            Duration::from_secs(self.config.initial_delay_secs),
            self.config.delay_multiplier,
            Duration::from_secs(self.config.max_delay_secs),
        );
        entry.next_reprocess_time = now + backoff.delay(entry.reprocess_attempts);
    }

    /// One reprocessing round over at most `batch_size` eligible entries.
    pub async fn run_once(&self) -> ReprocessOutcome {
        let mut outcome = ReprocessOutcome::default();
        let files = match self.dlq.list_files().await {
            Ok(files) => files,
            Err(e) => {
                tracing::warn!(error = %e, "dead-letter reprocess scan failed");
                return outcome;
            }
        };
        let active = self.dlq.active_file();
        let mut quota = self.config.batch_size;

        for path in files {
            if quota == 0 {
                break;
            }
            // The writer owns its current file; leave it alone.
            if Some(&path) == active.as_ref() {
                continue;
            }
            let lock = self.dlq.file_lock(&path);
            let _guard = lock.lock().await;

            let entries = match self.dlq.read_entries(&path).await {
                Ok(entries) => entries,
                Err(_) => continue, // raced with retention
            };

            let now = SystemTime::now();
            let mut kept: Vec<DlqEntry> = Vec::with_capacity(entries.len());
            let mut touched = false;
            for mut entry in entries {
                outcome.scanned += 1;
                if quota == 0 || !self.eligible(&entry, now) {
                    outcome.skipped += 1;
                    kept.push(entry);
                    continue;
                }
                quota -= 1;
                match (self.callback)(entry.clone()).await {
                    Ok(()) => {
                        outcome.succeeded += 1;
                        touched = true;
                        self.dlq.metrics.incr(&self.dlq.metrics.dlq_reprocessed);
                        tracing::debug!(id = %entry.id, sink = %entry.failed_sink, "dead-letter entry replayed");
                    }
                    Err(e) => {
                        outcome.failed += 1;
                        touched = true;
                        self.push_out(&mut entry, now);
                        tracing::debug!(
                            id = %entry.id,
                            attempts = entry.reprocess_attempts,
                            error = %e,
                            "dead-letter replay failed"
                        );
                        kept.push(entry);
                    }
                }
            }

            if touched {
                if let Err(e) = self.dlq.rewrite_file(&path, &kept).await {
                    tracing::error!(?path, error = %e, "dead-letter rewrite failed");
                }
            }
        }

        if outcome.succeeded + outcome.failed > 0 {
            tracing::info!(
                succeeded = outcome.succeeded,
                failed = outcome.failed,
                skipped = outcome.skipped,
                "dead-letter reprocessing round finished"
            );
        }
        outcome
    }

    /// Run rounds on the configured interval until cancellation. The current
    /// round always finishes; cancellation only stops new ones.
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let interval = self.config.interval();
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        self.run_once().await;
                    }
                }
            }
        })
    }
}
