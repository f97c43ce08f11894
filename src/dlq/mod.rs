//! Dead-letter queue: a rotating on-disk parking lot for entries a sink
//! could not accept.
//!
//! Ingress is a non-blocking bounded channel so a stalling disk never stalls
//! a dispatcher worker. A dedicated writer task owns the current file,
//! appends one JSON object per line, rotates on size, and fsyncs on an
//! interval. Retention removes files by age and count. Reprocessing lives in
//! [`reprocess`].

mod reprocess;

pub use reprocess::{ReprocessCallback, ReprocessOutcome, Reprocessor};

use crate::config::DlqConfig;
use crate::entry::{ts_millis, LogEntry};
use crate::error::ErrorKind;
use crate::metrics::PipelineMetrics;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("dead-letter io: {0}")]
    Io(#[from] std::io::Error),
    #[error("dead-letter serialization: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("dead-letter writer already running")]
    WriterTaken,
}

/// One parked entry, serialized as a single JSON line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqEntry {
    pub id: String,
    #[serde(with = "ts_millis")]
    pub timestamp: SystemTime,
    pub original_entry: LogEntry,
    pub failed_sink: String,
    pub error_kind: ErrorKind,
    pub error_message: String,
    /// Delivery retries spent before parking.
    pub retry_count: u32,
    pub reprocess_attempts: u32,
    #[serde(with = "ts_millis")]
    pub next_reprocess_time: SystemTime,
}

/// Shared handle to the dead-letter queue.
pub struct DeadLetterQueue {
    config: DlqConfig,
    metrics: Arc<PipelineMetrics>,
    sender: mpsc::Sender<DlqEntry>,
    receiver: Mutex<Option<mpsc::Receiver<DlqEntry>>>,
    /// File the writer is currently appending to; reprocess skips it.
    active_file: Mutex<Option<PathBuf>>,
    /// Per-file rewrite locks serializing reprocess against retention.
    file_locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
    seq: AtomicU64,
}

impl std::fmt::Debug for DeadLetterQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterQueue")
            .field("directory", &self.config.directory)
            .finish_non_exhaustive()
    }
}

impl DeadLetterQueue {
    /// Create the directory, sweep leftover `.tmp` files from interrupted
    /// rewrites, and hand back the queue. Directory failures are fatal and
    /// belong to dispatcher start-up.
    pub async fn open(
        config: DlqConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<Arc<Self>, DlqError> {
        tokio::fs::create_dir_all(&config.directory).await?;

        let mut dir = tokio::fs::read_dir(&config.directory).await?;
        while let Some(dirent) = dir.next_entry().await? {
            let path = dirent.path();
            if path.extension().is_some_and(|ext| ext == "tmp") {
                tracing::warn!(?path, "removing stale dead-letter tmp file");
                let _ = tokio::fs::remove_file(&path).await;
            }
        }

        let (sender, receiver) = mpsc::channel(config.queue_size);
        Ok(Arc::new(Self {
            config,
            metrics,
            sender,
            receiver: Mutex::new(Some(receiver)),
            active_file: Mutex::new(None),
            file_locks: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
        }))
    }

    pub fn directory(&self) -> &Path {
        &self.config.directory
    }

    /// Park one entry. Never blocks: a full channel drops the entry and
    /// bumps the write-error counter.
    pub fn add_entry(
        &self,
        entry: &LogEntry,
        failed_sink: &str,
        error_kind: ErrorKind,
        error_message: &str,
        retry_count: u32,
    ) {
        let now = SystemTime::now();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let dlq_entry = DlqEntry {
            id: format!("dlq-{}-{}", entry.source_id, seq),
            timestamp: now,
            original_entry: entry.clone(),
            failed_sink: failed_sink.to_string(),
            error_kind,
            error_message: error_message.to_string(),
            retry_count,
            reprocess_attempts: 0,
            next_reprocess_time: now,
        };
        match self.sender.try_send(dlq_entry) {
            Ok(()) => {
                self.metrics.incr(&self.metrics.dlq_entries);
            }
            Err(e) => {
                self.metrics.incr(&self.metrics.dlq_write_errors);
                tracing::error!(sink = failed_sink, error = %e, "dead-letter queue full, entry lost");
            }
        }
    }

    /// Rewrite lock for one file. Held across read-modify-rename cycles.
    pub(crate) fn file_lock(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        self.file_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(path.to_path_buf())
            .or_default()
            .clone()
    }

    pub(crate) fn active_file(&self) -> Option<PathBuf> {
        self.active_file
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_active_file(&self, path: Option<PathBuf>) {
        *self
            .active_file
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = path;
    }

    fn next_file_name(&self) -> PathBuf {
        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let base = self.config.directory.join(format!("dlq_{stamp}.log"));
        if !base.exists() {
            return base;
        }
        // Same-second rotation: suffix until free.
        for n in 1.. {
            let candidate = self
                .config
                .directory
                .join(format!("dlq_{stamp}_{n}.log"));
            if !candidate.exists() {
                return candidate;
            }
        }
        unreachable!()
    }

    /// Spawn the writer task. Exactly one writer may run per queue.
    pub fn spawn_writer(
        self: &Arc<Self>,
        token: CancellationToken,
    ) -> Result<JoinHandle<()>, DlqError> {
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or(DlqError::WriterTaken)?;
        let dlq = self.clone();
        Ok(tokio::spawn(async move {
            dlq.writer_loop(receiver, token).await;
        }))
    }

    async fn writer_loop(&self, mut receiver: mpsc::Receiver<DlqEntry>, token: CancellationToken) {
        let mut writer = FileWriter::new(self);
        let mut flush_tick = tokio::time::interval(self.config.flush_interval());
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        flush_tick.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = flush_tick.tick() => writer.sync().await,
                received = receiver.recv() => match received {
                    Some(entry) => writer.append(entry).await,
                    None => break,
                },
            }
        }

        // Drain whatever the workers managed to park before cancellation.
        while let Ok(entry) = receiver.try_recv() {
            writer.append(entry).await;
        }
        writer.sync().await;
        self.set_active_file(None);
        tracing::debug!("dead-letter writer stopped");
    }

    /// Enforce the age and count retention rules once.
    pub async fn enforce_retention(&self) {
        let mut files = match self.list_files().await {
            Ok(files) => files,
            Err(e) => {
                tracing::warn!(error = %e, "dead-letter retention scan failed");
                return;
            }
        };

        let cutoff = SystemTime::now()
            .checked_sub(self.config.retention())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let active = self.active_file();

        let mut removed = Vec::new();
        for path in files.clone() {
            if Some(&path) == active.as_ref() {
                continue;
            }
            let stale = tokio::fs::metadata(&path)
                .await
                .and_then(|m| m.modified())
                .map(|mtime| mtime < cutoff)
                .unwrap_or(false);
            if stale {
                let lock = self.file_lock(&path);
                let _guard = lock.lock().await;
                if tokio::fs::remove_file(&path).await.is_ok() {
                    removed.push(path);
                }
            }
        }
        files.retain(|p| !removed.contains(p));

        // Oldest first by name; trim beyond the file-count cap.
        while files.len() > self.config.max_files {
            let path = files.remove(0);
            if Some(&path) == active.as_ref() {
                continue;
            }
            let lock = self.file_lock(&path);
            let _guard = lock.lock().await;
            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::warn!(?path, error = %e, "failed to trim dead-letter file");
            } else {
                removed.push(path);
            }
        }

        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "dead-letter retention removed files");
        }
    }

    /// Run the daily retention sweep until cancellation.
    pub fn spawn_retention(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let dlq = self.clone();
        tokio::spawn(async move {
            let day = std::time::Duration::from_secs(24 * 3600);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(day) => dlq.enforce_retention().await,
                }
            }
        })
    }

    /// All DLQ files, ASCII-sorted by name (which is time order).
    pub async fn list_files(&self) -> Result<Vec<PathBuf>, DlqError> {
        let mut files = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.config.directory).await?;
        while let Some(dirent) = dir.next_entry().await? {
            let path = dirent.path();
            let name = dirent.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("dlq_") && name.ends_with(".log") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Parse one file, skipping corrupt lines.
    pub async fn read_entries(&self, path: &Path) -> Result<Vec<DlqEntry>, DlqError> {
        let raw = tokio::fs::read_to_string(path).await?;
        let mut entries = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<DlqEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::warn!(?path, error = %e, "skipping corrupt dead-letter line");
                }
            }
        }
        Ok(entries)
    }

    /// Replace a file's contents atomically via `<file>.tmp` + rename. An
    /// empty entry list removes the file. Caller holds the file lock.
    pub(crate) async fn rewrite_file(
        &self,
        path: &Path,
        entries: &[DlqEntry],
    ) -> Result<(), DlqError> {
        if entries.is_empty() {
            tokio::fs::remove_file(path).await?;
            return Ok(());
        }
        let tmp = path.with_extension("tmp");
        let mut buf = String::new();
        for entry in entries {
            buf.push_str(&serde_json::to_string(entry)?);
            buf.push('\n');
        }
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(buf.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

/// Append-side state owned by the writer task.
struct FileWriter<'a> {
    dlq: &'a DeadLetterQueue,
    file: Option<tokio::fs::File>,
    path: Option<PathBuf>,
    written: u64,
    dirty: bool,
}

impl<'a> FileWriter<'a> {
    fn new(dlq: &'a DeadLetterQueue) -> Self {
        Self { dlq, file: None, path: None, written: 0, dirty: false }
    }

    async fn roll(&mut self) -> Result<(), DlqError> {
        if let Some(file) = self.file.take() {
            let _ = file.sync_all().await;
        }
        let path = self.dlq.next_file_name();
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        self.written = file.metadata().await.map(|m| m.len()).unwrap_or(0);
        tracing::debug!(?path, "dead-letter writer rotated");
        self.dlq.set_active_file(Some(path.clone()));
        self.path = Some(path);
        self.file = Some(file);
        Ok(())
    }

    async fn append(&mut self, entry: DlqEntry) {
        if let Err(e) = self.try_append(&entry).await {
            self.dlq.metrics.incr(&self.dlq.metrics.dlq_write_errors);
            tracing::error!(error = %e, id = %entry.id, "failed to persist dead-letter entry");
        }
    }

    async fn try_append(&mut self, entry: &DlqEntry) -> Result<(), DlqError> {
        if self.file.is_none() || self.written >= self.dlq.config.max_file_size() {
            self.roll().await?;
        }
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let file = self.file.as_mut().ok_or(DlqError::WriterTaken)?;
        file.write_all(line.as_bytes()).await?;
        self.written += line.len() as u64;
        self.dirty = true;
        Ok(())
    }

    async fn sync(&mut self) {
        if !self.dirty {
            return;
        }
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.sync_data().await {
                tracing::warn!(error = %e, "dead-letter fsync failed");
            }
        }
        self.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReprocessConfig;

    fn test_config(dir: &Path) -> DlqConfig {
        DlqConfig {
            enabled: true,
            queue_size: 16,
            directory: dir.to_path_buf(),
            max_files: 3,
            max_file_size_mb: 1,
            retention_days: 7,
            flush_interval_ms: 20,
            reprocessing: ReprocessConfig::default(),
        }
    }

    fn entry(msg: &str) -> LogEntry {
        LogEntry::new("container", "c-1", msg)
    }

    async fn open(dir: &Path) -> Arc<DeadLetterQueue> {
        DeadLetterQueue::open(test_config(dir), Arc::new(PipelineMetrics::new()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn entries_are_persisted_one_json_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let dlq = open(dir.path()).await;
        let token = CancellationToken::new();
        let writer = dlq.spawn_writer(token.clone()).unwrap();

        dlq.add_entry(&entry("a"), "http", ErrorKind::Transient, "timeout", 2);
        dlq.add_entry(&entry("b"), "http", ErrorKind::Permanent, "bad payload", 0);

        token.cancel();
        writer.await.unwrap();

        let files = dlq.list_files().await.unwrap();
        assert_eq!(files.len(), 1);
        let entries = dlq.read_entries(&files[0]).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].original_entry.message, "a");
        assert_eq!(entries[0].retry_count, 2);
        assert_eq!(entries[0].error_kind, ErrorKind::Transient);
        assert_eq!(entries[1].error_kind, ErrorKind::Permanent);
    }

    #[tokio::test]
    async fn full_channel_drops_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(PipelineMetrics::new());
        let mut config = test_config(dir.path());
        config.queue_size = 2;
        let dlq = DeadLetterQueue::open(config, metrics.clone()).await.unwrap();
        // No writer running: the channel fills at 2.
        for i in 0..5 {
            dlq.add_entry(&entry(&format!("m{i}")), "s", ErrorKind::Transient, "x", 0);
        }
        let snap = metrics.snapshot();
        assert_eq!(snap.dlq_entries, 2);
        assert_eq!(snap.dlq_write_errors, 3);
    }

    #[tokio::test]
    async fn rotation_by_size_produces_sorted_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.max_file_size_mb = 0; // rotate on every entry
        let dlq = DeadLetterQueue::open(config, Arc::new(PipelineMetrics::new()))
            .await
            .unwrap();
        let token = CancellationToken::new();
        let writer = dlq.spawn_writer(token.clone()).unwrap();

        for i in 0..3 {
            dlq.add_entry(&entry(&format!("m{i}")), "s", ErrorKind::Transient, "x", 1);
        }
        token.cancel();
        writer.await.unwrap();

        let files = dlq.list_files().await.unwrap();
        assert!(files.len() >= 2, "expected rotation, got {files:?}");
        let mut sorted = files.clone();
        sorted.sort();
        assert_eq!(files, sorted, "list_files returns name order");
    }

    #[tokio::test]
    async fn second_writer_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let dlq = open(dir.path()).await;
        let token = CancellationToken::new();
        let writer = dlq.spawn_writer(token.clone()).unwrap();
        assert!(matches!(
            dlq.spawn_writer(token.clone()),
            Err(DlqError::WriterTaken)
        ));
        token.cancel();
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn stale_tmp_files_are_removed_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = dir.path().join("dlq_20240101_000000.tmp");
        tokio::fs::write(&tmp, "half-finished").await.unwrap();
        let _dlq = open(dir.path()).await;
        assert!(!tmp.exists());
    }

    #[tokio::test]
    async fn retention_trims_beyond_file_cap() {
        let dir = tempfile::tempdir().unwrap();
        let dlq = open(dir.path()).await;
        for i in 0..5 {
            let path = dir.path().join(format!("dlq_2024010{}_000000.log", i + 1));
            tokio::fs::write(&path, "{}\n").await.unwrap();
        }
        dlq.enforce_retention().await;
        let files = dlq.list_files().await.unwrap();
        assert_eq!(files.len(), 3, "capped at max_files");
        // The oldest names went first.
        assert!(files[0].to_string_lossy().contains("20240103"));
    }

    #[tokio::test]
    async fn rewrite_is_atomic_and_removes_empty_files() {
        let dir = tempfile::tempdir().unwrap();
        let dlq = open(dir.path()).await;
        let path = dir.path().join("dlq_20240101_000000.log");

        let mut parked = DlqEntry {
            id: "dlq-x-0".into(),
            timestamp: SystemTime::now(),
            original_entry: entry("m"),
            failed_sink: "s".into(),
            error_kind: ErrorKind::Transient,
            error_message: "x".into(),
            retry_count: 1,
            reprocess_attempts: 0,
            next_reprocess_time: SystemTime::now(),
        };
        dlq.rewrite_file(&path, std::slice::from_ref(&parked))
            .await
            .unwrap();
        assert_eq!(dlq.read_entries(&path).await.unwrap().len(), 1);

        parked.reprocess_attempts = 3;
        dlq.rewrite_file(&path, std::slice::from_ref(&parked))
            .await
            .unwrap();
        let read_back = dlq.read_entries(&path).await.unwrap();
        assert_eq!(read_back[0].reprocess_attempts, 3);
        assert!(!path.with_extension("tmp").exists());

        dlq.rewrite_file(&path, &[]).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn corrupt_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let dlq = open(dir.path()).await;
        let path = dir.path().join("dlq_20240101_000000.log");
        let good = serde_json::json!({
            "id": "dlq-x-1",
            "timestamp": 1_700_000_000_000u64,
            "original_entry": entry("ok"),
            "failed_sink": "s",
            "error_kind": "transient",
            "error_message": "x",
            "retry_count": 0,
            "reprocess_attempts": 0,
            "next_reprocess_time": 1_700_000_000_000u64
        });
        let content = format!("not json\n{good}\n");
        tokio::fs::write(&path, content).await.unwrap();

        let entries = dlq.read_entries(&path).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].original_entry.message, "ok");
    }
}
