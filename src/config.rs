//! Top-level config loaded from `logsift.toml`, with env overrides for the
//! SMTP block (`LOGSIFT_SMTP_*`).

use serde::Deserialize;
use std::path::Path;

use crate::buffer::BufferSettings;
use crate::index::IndexSettings;
use crate::models::shard::{ShardConfiguration, ShardingType};
use crate::notify::{NotifySettings, SmtpConfig};
use crate::scanner::ScannerSettings;
use crate::search::SearchSettings;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LogsiftConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub alarms: AlarmsConfig,
    #[serde(default)]
    pub sharding: ShardingConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: default_port() }
    }
}

fn default_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> String {
    "./logsift-data".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct BufferConfig {
    #[serde(default = "default_max_records")]
    pub max_records: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_commit_retries")]
    pub commit_retries: u32,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_records: default_max_records(),
            flush_interval_ms: default_flush_interval_ms(),
            commit_retries: default_commit_retries(),
        }
    }
}

fn default_max_records() -> usize {
    5000
}

fn default_flush_interval_ms() -> u64 {
    2000
}

fn default_commit_retries() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_fsync_retries")]
    pub fsync_retries: u32,
    #[serde(default = "default_merge_threshold")]
    pub merge_segment_threshold: usize,
    /// Keep the pre-redaction raw line in the row store.
    #[serde(default = "default_true")]
    pub store_raw: bool,
    #[serde(default = "default_housekeep_interval")]
    pub housekeep_interval_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            fsync_retries: default_fsync_retries(),
            merge_segment_threshold: default_merge_threshold(),
            store_raw: true,
            housekeep_interval_secs: default_housekeep_interval(),
        }
    }
}

fn default_fsync_retries() -> u32 {
    3
}

fn default_merge_threshold() -> usize {
    8
}

fn default_housekeep_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_read_retries")]
    pub read_retries: u32,
    #[serde(default = "default_grace_seconds")]
    pub grace_seconds: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            read_retries: default_read_retries(),
            grace_seconds: default_grace_seconds(),
        }
    }
}

fn default_batch_size() -> usize {
    512
}

fn default_read_retries() -> u32 {
    3
}

fn default_grace_seconds() -> u64 {
    3600
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_range_days")]
    pub default_range_days: i64,
    #[serde(default = "default_max_stream_secs")]
    pub max_stream_secs: u64,
    #[serde(default = "default_snapshot_interval_ms")]
    pub snapshot_interval_ms: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_range_days: default_range_days(),
            max_stream_secs: default_max_stream_secs(),
            snapshot_interval_ms: default_snapshot_interval_ms(),
        }
    }
}

fn default_range_days() -> i64 {
    30
}

fn default_max_stream_secs() -> u64 {
    60
}

fn default_snapshot_interval_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_retention_interval")]
    pub interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_retention_interval(),
        }
    }
}

fn default_retention_interval() -> u64 {
    3600
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlarmsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_alarm_interval")]
    pub eval_interval_secs: u64,
}

impl Default for AlarmsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            eval_interval_secs: default_alarm_interval(),
        }
    }
}

fn default_alarm_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShardingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_sharding_type")]
    pub sharding_type: String,
    #[serde(default = "default_one")]
    pub number_of_shards: usize,
    #[serde(default)]
    pub replication_enabled: bool,
    #[serde(default = "default_one")]
    pub replication_factor: usize,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sharding_type: default_sharding_type(),
            number_of_shards: 1,
            replication_enabled: false,
            replication_factor: 1,
        }
    }
}

fn default_sharding_type() -> String {
    "TIME_BASED".to_string()
}

fn default_one() -> usize {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifyConfig {
    #[serde(default = "default_channel_timeout")]
    pub channel_timeout_secs: u64,
    #[serde(default = "default_retry_elapsed")]
    pub max_retry_elapsed_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            channel_timeout_secs: default_channel_timeout(),
            max_retry_elapsed_secs: default_retry_elapsed(),
        }
    }
}

fn default_channel_timeout() -> u64 {
    10
}

fn default_retry_elapsed() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl LogsiftConfig {
    /// Load config from a TOML file. Returns defaults if the file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("config file not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: LogsiftConfig = toml::from_str(&contents)?;
        tracing::info!("loaded config from {}", path.display());
        Ok(config)
    }

    pub fn buffer_settings(&self) -> BufferSettings {
        BufferSettings {
            max_records: self.buffer.max_records.max(1),
            flush_interval_ms: self.buffer.flush_interval_ms,
            commit_retries: self.buffer.commit_retries,
        }
    }

    pub fn index_settings(&self) -> IndexSettings {
        IndexSettings {
            fsync_retries: self.index.fsync_retries,
            merge_segment_threshold: self.index.merge_segment_threshold.max(2),
            store_raw: self.index.store_raw,
        }
    }

    pub fn scanner_settings(&self) -> ScannerSettings {
        ScannerSettings {
            batch_size: self.scanner.batch_size.max(1),
            read_retries: self.scanner.read_retries,
            grace_seconds: self.scanner.grace_seconds,
        }
    }

    pub fn search_settings(&self) -> SearchSettings {
        SearchSettings {
            default_range_days: self.search.default_range_days.max(1),
            max_stream_secs: self.search.max_stream_secs.max(1),
            snapshot_interval_ms: self.search.snapshot_interval_ms,
        }
    }

    pub fn notify_settings(&self) -> NotifySettings {
        NotifySettings {
            channel_timeout_secs: self.notify.channel_timeout_secs.max(1),
            max_retry_elapsed_secs: self.notify.max_retry_elapsed_secs,
        }
    }

    pub fn shard_configuration(&self) -> ShardConfiguration {
        let sharding_type = match self.sharding.sharding_type.as_str() {
            "SOURCE_BASED" => ShardingType::SourceBased,
            "BALANCED" => ShardingType::Balanced,
            _ => ShardingType::TimeBased,
        };
        ShardConfiguration {
            id: "default".to_string(),
            sharding_type,
            number_of_shards: self.sharding.number_of_shards.max(1),
            replication_enabled: self.sharding.replication_enabled,
            replication_factor: self.sharding.replication_factor.max(1),
            sharding_enabled: self.sharding.enabled,
        }
    }

    /// SMTP settings come from the environment, like the rest of the
    /// deployment-specific secrets.
    pub fn smtp_from_env(&self) -> SmtpConfig {
        SmtpConfig {
            host: std::env::var("LOGSIFT_SMTP_HOST").ok(),
            port: std::env::var("LOGSIFT_SMTP_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(587),
            user: std::env::var("LOGSIFT_SMTP_USER").ok(),
            pass: std::env::var("LOGSIFT_SMTP_PASS").ok(),
            from: std::env::var("LOGSIFT_SMTP_FROM")
                .unwrap_or_else(|_| "logsift@localhost".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = LogsiftConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.buffer.max_records, 5000);
        assert_eq!(config.retention.interval_secs, 3600);
        assert_eq!(config.alarms.eval_interval_secs, 60);
        assert!(config.index.store_raw);
        assert_eq!(config.shard_configuration().group_count(), 1);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: LogsiftConfig = toml::from_str(
            r#"
            [server]
            port = 9000

            [sharding]
            enabled = true
            sharding_type = "SOURCE_BASED"
            number_of_shards = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.buffer.flush_interval_ms, 2000);
        let shards = config.shard_configuration();
        assert_eq!(shards.group_count(), 4);
        assert_eq!(shards.sharding_type, ShardingType::SourceBased);
    }
}
