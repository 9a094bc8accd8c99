//! The log scanner: tails files in the configured directories, parses
//! complete lines into records, and submits them to the buffer. Offsets
//! advance only after the buffer acknowledges a durable commit, so a crash
//! or kill mid-flush re-reads nothing that was committed and loses nothing
//! that was not.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use regex::Regex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::buffer::LogBuffer;
use crate::config_db::ConfigDb;
use crate::models::directory::LogDirectoryConfig;
use crate::models::log::{LogLevel, LogRecord};
use crate::offsets::{FileOffsetState, OffsetStore};

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("directory config not found")]
    NotFound,
    #[error("directory config is disabled")]
    Disabled,
    #[error("scan failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct ScannerSettings {
    /// Records per submission to the buffer.
    pub batch_size: usize,
    /// Read retries (with backoff) before a file is skipped for one cycle.
    pub read_retries: u32,
    /// How long a vanished file's offset state survives.
    pub grace_seconds: u64,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            batch_size: 512,
            read_retries: 3,
            grace_seconds: 3600,
        }
    }
}

/// Per-config runtime: the mutex serializes scans of one directory while
/// distinct directories scan in parallel.
struct DirRuntime {
    scan_lock: Arc<tokio::sync::Mutex<()>>,
    last_scan: std::sync::Mutex<Option<Instant>>,
    /// Paths that exhausted their read retries, skipped for one cycle.
    unreadable: std::sync::Mutex<HashSet<PathBuf>>,
}

impl DirRuntime {
    fn new() -> Self {
        Self {
            scan_lock: Arc::new(tokio::sync::Mutex::new(())),
            last_scan: std::sync::Mutex::new(None),
            unreadable: std::sync::Mutex::new(HashSet::new()),
        }
    }
}

#[derive(Clone)]
pub struct Scanner {
    inner: Arc<ScannerInner>,
}

struct ScannerInner {
    config_db: Arc<ConfigDb>,
    offsets: OffsetStore,
    buffer: LogBuffer,
    settings: ScannerSettings,
    runtimes: std::sync::Mutex<HashMap<String, Arc<DirRuntime>>>,
}

impl Scanner {
    pub fn new(
        config_db: Arc<ConfigDb>,
        offsets: OffsetStore,
        buffer: LogBuffer,
        settings: ScannerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(ScannerInner {
                config_db,
                offsets,
                buffer,
                settings,
                runtimes: std::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start the per-config scheduling loop. Each enabled directory config
    /// fires on its own `scan_interval_seconds` cadence.
    pub fn spawn(&self, shutdown: CancellationToken) {
        let scanner = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => scanner.dispatch_due().await,
                    _ = shutdown.cancelled() => {
                        tracing::info!("log scanner stopped");
                        return;
                    }
                }
            }
        });
    }

    async fn dispatch_due(&self) {
        let configs = match self.inner.config_db.list_directory_configs() {
            Ok(configs) => configs,
            Err(e) => {
                tracing::error!("scanner: cannot list directory configs: {e}");
                return;
            }
        };
        for config in configs.into_iter().filter(|c| c.enabled) {
            let runtime = self.runtime_for(&config.id);
            let due = {
                let last = runtime.last_scan.lock().unwrap();
                last.map(|t| t.elapsed() >= Duration::from_secs(config.scan_interval_seconds.max(1)))
                    .unwrap_or(true)
            };
            if !due {
                continue;
            }
            // Same directory never scans concurrently; a held lock means a
            // scan (timed or on-demand) is still running.
            let Ok(guard) = runtime.scan_lock.clone().try_lock_owned() else {
                continue;
            };
            *runtime.last_scan.lock().unwrap() = Some(Instant::now());
            let scanner = self.clone();
            tokio::spawn(async move {
                let _guard = guard;
                if let Err(e) = scanner.scan_directory(&config, &runtime).await {
                    tracing::warn!("scan of {} failed: {e}", config.directory_path);
                }
            });
        }
    }

    /// On-demand scan, preempting the timer. Serializes with any running
    /// scan of the same config and returns the processed record count.
    pub async fn scan_now(&self, id: &str) -> Result<u64, ScanError> {
        let config = self
            .inner
            .config_db
            .get_directory_config(id)
            .map_err(|e| ScanError::Failed(e.to_string()))?
            .ok_or(ScanError::NotFound)?;
        if !config.enabled {
            return Err(ScanError::Disabled);
        }
        let runtime = self.runtime_for(&config.id);
        let _guard = runtime.scan_lock.clone().lock_owned().await;
        *runtime.last_scan.lock().unwrap() = Some(Instant::now());
        self.scan_directory(&config, &runtime)
            .await
            .map_err(|e| ScanError::Failed(e.to_string()))
    }

    /// Scan every enabled config once; returns the total processed count.
    pub async fn scan_all_now(&self) -> Result<u64, ScanError> {
        let configs = self
            .inner
            .config_db
            .list_directory_configs()
            .map_err(|e| ScanError::Failed(e.to_string()))?;
        let mut total = 0u64;
        for config in configs.into_iter().filter(|c| c.enabled) {
            match self.scan_now(&config.id).await {
                Ok(count) => total += count,
                Err(e) => tracing::warn!("scan-all: {} failed: {e}", config.directory_path),
            }
        }
        Ok(total)
    }

    fn runtime_for(&self, id: &str) -> Arc<DirRuntime> {
        let mut runtimes = self.inner.runtimes.lock().unwrap();
        runtimes
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(DirRuntime::new()))
            .clone()
    }

    async fn scan_directory(
        &self,
        config: &LogDirectoryConfig,
        runtime: &DirRuntime,
    ) -> anyhow::Result<u64> {
        let dir = PathBuf::from(&config.directory_path);
        let pattern = glob_to_regex(&config.file_pattern)?;
        let skip_this_cycle = std::mem::take(&mut *runtime.unreadable.lock().unwrap());

        let mut files = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if pattern.is_match(name) {
                files.push(path);
            }
        }
        files.sort();

        let mut processed = 0u64;
        let mut live = HashSet::new();
        for path in files {
            if skip_this_cycle.contains(&path) {
                tracing::debug!("{}: skipping for one cycle after read failures", path.display());
                continue;
            }
            match self.scan_file(&path).await {
                Ok((count, fingerprint)) => {
                    processed += count;
                    live.insert(fingerprint);
                }
                Err(e) => {
                    tracing::warn!("{}: unreadable, will retry next cycle: {e}", path.display());
                    runtime.unreadable.lock().unwrap().insert(path);
                }
            }
        }

        let now = chrono::Utc::now().timestamp_millis();
        if let Err(e) = self.inner.offsets.prune(
            &config.directory_path,
            &live,
            self.inner.settings.grace_seconds,
            now,
        ) {
            tracing::warn!("offset prune failed: {e}");
        }
        if processed > 0 {
            tracing::debug!(
                "scanned {} ({processed} record(s))",
                config.directory_path
            );
        }
        Ok(processed)
    }

    /// Tail one file from its stored offset. Returns the processed record
    /// count and the file's fingerprint.
    async fn scan_file(&self, path: &Path) -> anyhow::Result<(u64, String)> {
        let settings = &self.inner.settings;
        let now = chrono::Utc::now().timestamp_millis();

        let read = {
            let path = path.to_path_buf();
            let retries = settings.read_retries;
            tokio::task::spawn_blocking(move || read_with_retries(&path, retries)).await??
        };
        let meta = read.meta;
        let fingerprint = read.fingerprint.clone();

        let stored = self
            .inner
            .offsets
            .get_by_path(&path.display().to_string())?;
        let mut state = match stored {
            // Same file as last time: resume from the stored offset.
            Some(s) if s.fingerprint == fingerprint && s.offset <= meta.len => s,
            // Rotation (new fingerprint) or truncation: start over. The old
            // row survives under its old fingerprint until grace expiry.
            Some(s) => {
                if s.fingerprint == fingerprint {
                    tracing::info!("{}: truncated, restarting at 0", path.display());
                } else {
                    tracing::info!("{}: rotated, restarting at 0", path.display());
                }
                FileOffsetState {
                    fingerprint: fingerprint.clone(),
                    path: path.display().to_string(),
                    offset: 0,
                    last_modified: meta.modified_ms,
                    partial: String::new(),
                    last_ts: 0,
                    last_seen: now,
                }
            }
            None => FileOffsetState {
                fingerprint: fingerprint.clone(),
                path: path.display().to_string(),
                offset: 0,
                last_modified: meta.modified_ms,
                partial: String::new(),
                last_ts: 0,
                last_seen: now,
            },
        };

        if state.offset >= meta.len {
            self.inner.offsets.touch(&fingerprint, now)?;
            return Ok((0, fingerprint));
        }

        let bytes = {
            let path = path.to_path_buf();
            let offset = state.offset;
            let retries = settings.read_retries;
            tokio::task::spawn_blocking(move || read_from_offset(&path, offset, retries)).await??
        };
        let new_offset = state.offset + bytes.len() as u64;

        // Split into complete lines; an unterminated tail is carried in the
        // partial buffer until the next pass.
        let mut text = std::mem::take(&mut state.partial);
        text.push_str(&String::from_utf8_lossy(&bytes));
        let mut lines: Vec<&str> = text.split('\n').collect();
        let partial = if text.ends_with('\n') {
            String::new()
        } else {
            lines.pop().unwrap_or("").to_string()
        };

        let source = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();
        let mut last_ts = state.last_ts;
        let mut records = Vec::new();
        for line in lines {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() {
                continue;
            }
            let record = parse_line(line, &source, last_ts);
            last_ts = record.timestamp;
            records.push(record);
        }

        let mut count = 0u64;
        if !records.is_empty() {
            // Submit in bounded batches; commit acknowledgement gates the
            // offset advance below.
            for chunk in records.chunks(settings.batch_size) {
                let ack = self.inner.buffer.submit(chunk.to_vec()).await?;
                count += ack.wait().await? as u64;
            }
        }

        state.offset = new_offset;
        state.partial = partial;
        state.last_ts = last_ts;
        state.last_modified = meta.modified_ms;
        state.last_seen = now;
        self.inner.offsets.upsert(&state)?;
        Ok((count, fingerprint))
    }
}

struct FileMeta {
    len: u64,
    modified_ms: i64,
}

struct FileProbe {
    meta: FileMeta,
    fingerprint: String,
}

fn read_with_retries(path: &Path, retries: u32) -> anyhow::Result<FileProbe> {
    let mut backoff = Duration::from_millis(50);
    let mut attempt = 0u32;
    loop {
        match probe_file(path) {
            Ok(probe) => return Ok(probe),
            Err(e) if attempt < retries => {
                attempt += 1;
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(Duration::from_secs(2));
                tracing::debug!("{}: probe retry {attempt}: {e}", path.display());
            }
            Err(e) => return Err(e),
        }
    }
}

fn probe_file(path: &Path) -> anyhow::Result<FileProbe> {
    let meta = std::fs::metadata(path)?;
    let modified_ms = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    Ok(FileProbe {
        fingerprint: fingerprint(path, &meta)?,
        meta: FileMeta {
            len: meta.len(),
            modified_ms,
        },
    })
}

/// Stable identity across renames: device+inode where the platform has
/// them, otherwise size plus a hash of the file head.
#[cfg(unix)]
fn fingerprint(_path: &Path, meta: &std::fs::Metadata) -> anyhow::Result<String> {
    use std::os::unix::fs::MetadataExt;
    Ok(format!("dev{}-ino{}", meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn fingerprint(path: &Path, meta: &std::fs::Metadata) -> anyhow::Result<String> {
    use sha2::{Digest, Sha256};
    let mut file = std::fs::File::open(path)?;
    let mut head = [0u8; 4096];
    let n = file.read(&mut head)?;
    let mut hasher = Sha256::new();
    hasher.update(&head[..n]);
    Ok(format!("len{}-sha{:x}", meta.len(), hasher.finalize()))
}

fn read_from_offset(path: &Path, offset: u64, retries: u32) -> anyhow::Result<Vec<u8>> {
    let mut backoff = Duration::from_millis(50);
    let mut attempt = 0u32;
    loop {
        let result = (|| -> std::io::Result<Vec<u8>> {
            let mut file = std::fs::File::open(path)?;
            file.seek(SeekFrom::Start(offset))?;
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)?;
            Ok(buf)
        })();
        match result {
            Ok(buf) => return Ok(buf),
            Err(e) if attempt < retries => {
                attempt += 1;
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(Duration::from_secs(2));
                tracing::debug!("{}: read retry {attempt}: {e}", path.display());
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn glob_to_regex(pattern: &str) -> anyhow::Result<Regex> {
    let mut regex = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            c => regex.push_str(&regex::escape(&c.to_string())),
        }
    }
    regex.push('$');
    Ok(Regex::new(&regex)?)
}

fn line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^(?P<ts>\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:[.,]\d{1,9})?(?:Z|[+-]\d{2}:?\d{2})?)\s+(?:(?P<level>[A-Za-z]+)\s+)?(?P<rest>.*)$",
        )
        .expect("line grammar regex")
    })
}

/// Built-in line grammar: ISO-8601 timestamp prefix, optional level word,
/// remainder as message. Anything else becomes an UNKNOWN-level record
/// timestamped now. `floor_ts` keeps timestamps monotonic within one file.
pub fn parse_line(line: &str, source: &str, floor_ts: i64) -> LogRecord {
    let id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().timestamp_millis();

    if let Some(caps) = line_pattern().captures(line) {
        let ts_text = caps.name("ts").map(|m| m.as_str()).unwrap_or_default();
        if let Some(ts) = crate::fields::parse_date_ms(&ts_text.replace(',', ".")) {
            let (level, message) = match caps.name("level").map(|m| m.as_str()) {
                Some(word) => match LogLevel::parse(word) {
                    Some(level) => (
                        level,
                        caps.name("rest").map(|m| m.as_str()).unwrap_or("").to_string(),
                    ),
                    // Not a level word; it belongs to the message.
                    None => (
                        LogLevel::Unknown,
                        format!(
                            "{word} {}",
                            caps.name("rest").map(|m| m.as_str()).unwrap_or("")
                        )
                        .trim_end()
                        .to_string(),
                    ),
                },
                None => (
                    LogLevel::Unknown,
                    caps.name("rest").map(|m| m.as_str()).unwrap_or("").to_string(),
                ),
            };
            return LogRecord {
                id,
                timestamp: ts.max(floor_ts),
                level,
                source: source.to_string(),
                message,
                raw: Some(line.to_string()),
                fields: Default::default(),
                host: None,
            };
        }
    }

    LogRecord {
        id,
        timestamp: now.max(floor_ts),
        level: LogLevel::Unknown,
        source: source.to_string(),
        message: line.to_string(),
        raw: Some(line.to_string()),
        fields: Default::default(),
        host: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_timestamp_and_level() {
        let rec = parse_line("2025-01-01T00:00:01Z ERROR boom", "app.log", 0);
        assert_eq!(rec.timestamp, 1_735_689_601_000);
        assert_eq!(rec.level, LogLevel::Error);
        assert_eq!(rec.message, "boom");
        assert_eq!(rec.raw.as_deref(), Some("2025-01-01T00:00:01Z ERROR boom"));
    }

    #[test]
    fn level_word_is_optional() {
        let rec = parse_line("2025-01-01 00:00:01 started worker pool", "app.log", 0);
        assert_eq!(rec.level, LogLevel::Unknown);
        assert_eq!(rec.message, "started worker pool");
        assert_eq!(rec.timestamp, 1_735_689_600_000 + 1000);
    }

    #[test]
    fn non_level_word_stays_in_message() {
        let rec = parse_line("2025-01-01T00:00:01Z accepted connection", "app.log", 0);
        assert_eq!(rec.level, LogLevel::Unknown);
        assert_eq!(rec.message, "accepted connection");
    }

    #[test]
    fn garbage_falls_back_to_now_and_unknown() {
        let before = chrono::Utc::now().timestamp_millis();
        let rec = parse_line("no timestamp here", "app.log", 0);
        assert_eq!(rec.level, LogLevel::Unknown);
        assert_eq!(rec.message, "no timestamp here");
        assert!(rec.timestamp >= before);
    }

    #[test]
    fn timestamps_never_go_backwards() {
        let rec = parse_line("2020-01-01T00:00:00Z INFO late arrival", "app.log", 1_735_689_601_000);
        assert_eq!(rec.timestamp, 1_735_689_601_000);
    }

    #[test]
    fn glob_matching() {
        let re = glob_to_regex("*.log").unwrap();
        assert!(re.is_match("app.log"));
        assert!(!re.is_match("app.log.1"));
        let re = glob_to_regex("app-?.txt").unwrap();
        assert!(re.is_match("app-1.txt"));
        assert!(!re.is_match("app-12.txt"));
    }
}
