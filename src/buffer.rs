//! The log buffer: absorbs ingestion spikes and amortizes index commits.
//!
//! Admission is bounded by a semaphore of `max_records` permits; producers
//! block when the buffer is full (backpressure, never drops). A single
//! flusher task commits to the index when the pending count reaches
//! capacity or the oldest pending batch exceeds the flush interval.
//! Redaction and field extraction run at flush time under the config
//! snapshots captured when the batch entered the pipeline. Submissions are
//! acknowledged only after their records are durably committed, which is
//! what lets the scanner advance file offsets safely.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{Notify, Semaphore, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use serde::Serialize;

use crate::fields::{FieldCatalog, FieldRegistry};
use crate::index::IndexStore;
use crate::models::log::LogRecord;
use crate::redaction::{CompiledRedaction, RedactionEngine};

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("buffer is shut down")]
    Closed,
    #[error("batch was not committed")]
    Aborted,
}

#[derive(Debug, Clone)]
pub struct BufferSettings {
    pub max_records: usize,
    pub flush_interval_ms: u64,
    /// Commit retry attempts per backoff round before escalating the log
    /// level; backpressure holds until the commit eventually succeeds.
    pub commit_retries: u32,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            max_records: 5000,
            flush_interval_ms: 2000,
            commit_retries: 5,
        }
    }
}

struct Submission {
    records: Vec<LogRecord>,
    redaction: Arc<CompiledRedaction>,
    catalog: Arc<FieldCatalog>,
    permits: usize,
    enqueued_at: Instant,
    ack: oneshot::Sender<usize>,
}

struct Shared {
    permits: Semaphore,
    closed: AtomicBool,
    drained: AtomicBool,
    drained_notify: Notify,
    flush_count: AtomicU64,
    dropped: AtomicU64,
    flush_minute_window: std::sync::Mutex<Vec<Instant>>,
}

/// Producer-side metrics snapshot for operators.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferMetrics {
    pub current_size: usize,
    pub max_size: usize,
    pub utilization: f64,
    pub flush_interval_ms: u64,
    pub flushes_per_minute: u64,
    pub records_dropped: u64,
}

/// Cloneable producer handle; the flusher task owns the receiving end.
#[derive(Clone)]
pub struct LogBuffer {
    tx: mpsc::Sender<Submission>,
    shared: Arc<Shared>,
    settings: BufferSettings,
    redaction: Arc<RedactionEngine>,
    fields: Arc<FieldRegistry>,
    shutdown: CancellationToken,
}

/// Awaits durable acceptance of a submission.
pub struct AckHandle {
    receivers: Vec<oneshot::Receiver<usize>>,
}

impl AckHandle {
    /// Resolves with the committed record count once every chunk of the
    /// submission is in the index.
    pub async fn wait(self) -> Result<usize, BufferError> {
        let mut total = 0usize;
        for rx in self.receivers {
            total += rx.await.map_err(|_| BufferError::Aborted)?;
        }
        Ok(total)
    }
}

impl LogBuffer {
    pub fn start(
        settings: BufferSettings,
        index: Arc<IndexStore>,
        redaction: Arc<RedactionEngine>,
        fields: Arc<FieldRegistry>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let shared = Arc::new(Shared {
            permits: Semaphore::new(settings.max_records),
            closed: AtomicBool::new(false),
            drained: AtomicBool::new(false),
            drained_notify: Notify::new(),
            flush_count: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            flush_minute_window: std::sync::Mutex::new(Vec::new()),
        });
        let shutdown = CancellationToken::new();

        let buffer = Self {
            tx,
            shared: shared.clone(),
            settings: settings.clone(),
            redaction,
            fields,
            shutdown: shutdown.clone(),
        };
        tokio::spawn(flusher(rx, index, settings, shared, shutdown));
        buffer
    }

    /// Enqueue parsed records. Blocks while the buffer is at capacity and
    /// returns a handle that resolves once the records are committed.
    pub async fn submit(&self, records: Vec<LogRecord>) -> Result<AckHandle, BufferError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(BufferError::Closed);
        }
        let redaction = self.redaction.snapshot();
        let catalog = self.fields.snapshot();

        let mut receivers = Vec::new();
        let mut remaining = records;
        while !remaining.is_empty() {
            let take = remaining.len().min(self.settings.max_records);
            let rest = remaining.split_off(take);
            let chunk = std::mem::replace(&mut remaining, rest);

            // Backpressure: wait for capacity rather than dropping.
            let permits = self
                .shared
                .permits
                .acquire_many(chunk.len() as u32)
                .await
                .map_err(|_| BufferError::Closed)?;
            permits.forget();

            let (ack, rx) = oneshot::channel();
            let submission = Submission {
                permits: chunk.len(),
                records: chunk,
                redaction: redaction.clone(),
                catalog: catalog.clone(),
                enqueued_at: Instant::now(),
                ack,
            };
            if self.tx.send(submission).await.is_err() {
                self.shared.permits.add_permits(take);
                return Err(BufferError::Closed);
            }
            receivers.push(rx);
        }
        Ok(AckHandle { receivers })
    }

    pub fn metrics(&self) -> BufferMetrics {
        let available = self.shared.permits.available_permits();
        let current = self.settings.max_records.saturating_sub(available);
        let flushes_last_minute = {
            let mut window = self.shared.flush_minute_window.lock().unwrap();
            let cutoff = Instant::now() - Duration::from_secs(60);
            window.retain(|t| *t > cutoff);
            window.len() as u64
        };
        BufferMetrics {
            current_size: current,
            max_size: self.settings.max_records,
            utilization: current as f64 / self.settings.max_records.max(1) as f64,
            flush_interval_ms: self.settings.flush_interval_ms,
            flushes_per_minute: flushes_last_minute,
            records_dropped: self.shared.dropped.load(Ordering::Relaxed),
        }
    }

    /// Refuse new submissions, drain everything pending, and return once
    /// the flusher has committed the backlog.
    pub async fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shutdown.cancel();
        while !self.shared.drained.load(Ordering::Acquire) {
            let notified = self.shared.drained_notify.notified();
            if self.shared.drained.load(Ordering::Acquire) {
                break;
            }
            notified.await;
        }
    }
}

async fn flusher(
    mut rx: mpsc::Receiver<Submission>,
    index: Arc<IndexStore>,
    settings: BufferSettings,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) {
    let flush_interval = Duration::from_millis(settings.flush_interval_ms.max(1));
    let mut pending: Vec<Submission> = Vec::new();
    let mut pending_records = 0usize;

    loop {
        let deadline = pending
            .first()
            .map(|s| s.enqueued_at + flush_interval)
            .unwrap_or_else(|| Instant::now() + flush_interval);

        tokio::select! {
            submission = rx.recv() => {
                match submission {
                    Some(submission) => {
                        pending_records += submission.records.len();
                        pending.push(submission);
                        if pending_records >= settings.max_records {
                            flush(&index, &settings, &shared, &mut pending, false).await;
                            pending_records = 0;
                        }
                    }
                    None => break,
                }
            }
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)), if !pending.is_empty() => {
                flush(&index, &settings, &shared, &mut pending, false).await;
                pending_records = 0;
            }
            _ = shutdown.cancelled() => break,
        }
    }

    // Drain: accept whatever was already queued, then flush it all.
    while let Ok(submission) = rx.try_recv() {
        pending.push(submission);
    }
    rx.close();
    if !pending.is_empty() {
        flush(&index, &settings, &shared, &mut pending, true).await;
    }
    shared.drained.store(true, Ordering::Release);
    shared.drained_notify.notify_waiters();
    tracing::info!("log buffer drained and stopped");
}

/// Commit everything in `pending`. Retries with exponential backoff; on
/// persistent failure keeps retrying (permits stay held, producers block)
/// unless shutting down, where it gives up after one backoff round so the
/// process can exit. Unacked submissions leave scanner offsets unadvanced,
/// so nothing is lost either way.
async fn flush(
    index: &Arc<IndexStore>,
    settings: &BufferSettings,
    shared: &Arc<Shared>,
    pending: &mut Vec<Submission>,
    shutting_down: bool,
) {
    let submissions = std::mem::take(pending);
    let mut batch = Vec::new();
    let mut acks = Vec::new();
    let mut permits = 0usize;
    for submission in submissions {
        let processed = process(
            submission.records,
            &submission.redaction,
            &submission.catalog,
        );
        acks.push((submission.ack, processed.len()));
        permits += submission.permits;
        batch.extend(processed);
    }

    let mut backoff = Duration::from_millis(200);
    let mut attempt = 0u32;
    loop {
        let index = index.clone();
        let to_commit = batch.clone();
        let result = tokio::task::spawn_blocking(move || index.add_batch(to_commit)).await;
        match result {
            Ok(Ok(count)) => {
                shared.permits.add_permits(permits);
                shared.flush_count.fetch_add(1, Ordering::Relaxed);
                shared
                    .flush_minute_window
                    .lock()
                    .unwrap()
                    .push(Instant::now());
                for (ack, count) in acks {
                    let _ = ack.send(count);
                }
                tracing::debug!("flushed {count} record(s) to index");
                return;
            }
            Ok(Err(e)) => {
                attempt += 1;
                if attempt >= settings.commit_retries {
                    tracing::error!(
                        "index commit failing persistently (attempt {attempt}): {e}; holding backpressure"
                    );
                } else {
                    tracing::warn!("index commit failed (attempt {attempt}): {e}");
                }
                if shutting_down && attempt >= settings.commit_retries {
                    tracing::error!(
                        "giving up on final flush of {} record(s); offsets were not advanced",
                        batch.len()
                    );
                    shared.permits.add_permits(permits);
                    return;
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(30));
            }
            Err(join_err) => {
                tracing::error!("index commit task panicked: {join_err}");
                shared.permits.add_permits(permits);
                return;
            }
        }
    }
}

/// Apply the redaction and extraction pipeline under the snapshots the
/// batch entered with.
fn process(
    records: Vec<LogRecord>,
    redaction: &CompiledRedaction,
    catalog: &FieldCatalog,
) -> Vec<LogRecord> {
    records
        .into_iter()
        .map(|mut record| {
            record.message = redaction.redact("message", &record.message).into_owned();
            record.source = redaction.redact("source", &record.source).into_owned();
            if let Some(raw) = record.raw.take() {
                record.raw = Some(redaction.redact("raw", &raw).into_owned());
            }
            if let Some(host) = record.host.take() {
                record.host = Some(redaction.redact("host", &host).into_owned());
            }
            let mut fields = catalog.extract(&record);
            for (name, value) in fields.iter_mut() {
                let redacted = redaction.redact(name, value);
                if let std::borrow::Cow::Owned(v) = redacted {
                    *value = v;
                }
            }
            record.fields = fields;
            record
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::log::LogLevel;
    use crate::models::shard::ShardConfiguration;
    use crate::redaction::RedactionGroup;
    use std::collections::BTreeMap;

    fn record(id: &str, ts: i64, message: &str) -> LogRecord {
        LogRecord {
            id: id.into(),
            timestamp: ts,
            level: LogLevel::Info,
            source: "app.log".into(),
            message: message.into(),
            raw: None,
            fields: BTreeMap::new(),
            host: None,
        }
    }

    fn store(dir: &std::path::Path, fields: Arc<FieldRegistry>) -> Arc<IndexStore> {
        Arc::new(
            IndexStore::open(
                dir,
                &ShardConfiguration::default(),
                crate::index::IndexSettings::default(),
                fields,
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn submit_ack_makes_records_searchable() {
        let dir = tempfile::tempdir().unwrap();
        let fields = Arc::new(FieldRegistry::new(&[]));
        let index = store(dir.path(), fields.clone());
        let redaction = Arc::new(RedactionEngine::new(&BTreeMap::new()));
        let buffer = LogBuffer::start(
            BufferSettings {
                max_records: 100,
                flush_interval_ms: 10,
                commit_retries: 3,
            },
            index.clone(),
            redaction,
            fields,
        );

        let ack = buffer
            .submit(vec![record("a", 1, "hello"), record("b", 2, "world")])
            .await
            .unwrap();
        assert_eq!(ack.wait().await.unwrap(), 2);
        assert_eq!(index.total_count(), 2);
        assert_eq!(buffer.metrics().records_dropped, 0);
    }

    #[tokio::test]
    async fn flush_applies_redaction_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let fields = Arc::new(FieldRegistry::new(&[]));
        let index = store(dir.path(), fields.clone());
        let mut groups = BTreeMap::new();
        groups.insert(
            "message".to_string(),
            RedactionGroup {
                patterns: vec![r"password=\S+".to_string()],
            },
        );
        let redaction = Arc::new(RedactionEngine::new(&groups));
        let buffer = LogBuffer::start(
            BufferSettings {
                max_records: 10,
                flush_interval_ms: 10,
                commit_retries: 3,
            },
            index.clone(),
            redaction,
            fields,
        );

        let ack = buffer
            .submit(vec![record("a", 1, "password=secret123 user=a")])
            .await
            .unwrap();
        ack.wait().await.unwrap();

        let snapshot = index.snapshot(None);
        let rows: Vec<_> = snapshot.search(0, 10, &Vec::new(), |_| true).collect();
        assert_eq!(rows[0].message, "<REDACTED> user=a");
    }

    #[tokio::test]
    async fn size_trigger_flushes_before_interval() {
        let dir = tempfile::tempdir().unwrap();
        let fields = Arc::new(FieldRegistry::new(&[]));
        let index = store(dir.path(), fields.clone());
        let redaction = Arc::new(RedactionEngine::new(&BTreeMap::new()));
        let buffer = LogBuffer::start(
            BufferSettings {
                max_records: 4,
                flush_interval_ms: 3_600_000,
                commit_retries: 3,
            },
            index.clone(),
            redaction,
            fields,
        );

        let records: Vec<LogRecord> = (0..4)
            .map(|i| record(&format!("r{i}"), i as i64, "spam"))
            .collect();
        let ack = buffer.submit(records).await.unwrap();
        assert_eq!(ack.wait().await.unwrap(), 4);
        assert_eq!(index.total_count(), 4);
    }

    #[tokio::test]
    async fn shutdown_drains_and_refuses() {
        let dir = tempfile::tempdir().unwrap();
        let fields = Arc::new(FieldRegistry::new(&[]));
        let index = store(dir.path(), fields.clone());
        let redaction = Arc::new(RedactionEngine::new(&BTreeMap::new()));
        let buffer = LogBuffer::start(
            BufferSettings {
                max_records: 100,
                flush_interval_ms: 3_600_000,
                commit_retries: 3,
            },
            index.clone(),
            redaction,
            fields,
        );

        let ack = buffer.submit(vec![record("a", 1, "pending")]).await.unwrap();
        buffer.shutdown().await;
        assert_eq!(ack.wait().await.unwrap(), 1);
        assert_eq!(index.total_count(), 1);
        assert!(matches!(
            buffer.submit(vec![record("b", 2, "late")]).await,
            Err(BufferError::Closed)
        ));
    }
}
