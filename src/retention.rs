//! Retention execution: periodically deletes records older than each
//! enabled policy's cutoff, per source. Policies touching the same source
//! serialize on a per-source lock; disjoint policies run in parallel. The
//! effective rule for a source covered by several policies is therefore the
//! smallest `max_age_days`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config_db::ConfigDb;
use crate::index::{DeleteFilter, IndexStore};
use crate::models::retention::RetentionPolicy;

#[derive(Debug, Error)]
pub enum RetentionError {
    #[error("retention policy not found")]
    NotFound,
    #[error("retention apply failed: {0}")]
    Failed(String),
}

pub struct RetentionExecutor {
    config_db: Arc<ConfigDb>,
    index: Arc<IndexStore>,
    source_locks: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RetentionExecutor {
    pub fn new(config_db: Arc<ConfigDb>, index: Arc<IndexStore>) -> Self {
        Self {
            config_db,
            index,
            source_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Start the periodic pass (default hourly).
    pub fn spawn(self: Arc<Self>, interval_secs: u64, shutdown: CancellationToken) {
        let executor = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so a fresh start
            // does not race the scanner's initial pass.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match executor.apply_all().await {
                            Ok(deleted) if deleted > 0 => {
                                tracing::info!("retention pass deleted {deleted} record(s)");
                            }
                            Ok(_) => {}
                            Err(e) => tracing::error!("retention pass failed: {e}"),
                        }
                    }
                    _ = shutdown.cancelled() => {
                        tracing::info!("retention executor stopped");
                        return;
                    }
                }
            }
        });
    }

    /// Run every enabled policy once; policies run concurrently, with
    /// per-source locks serializing the overlapping ones.
    pub async fn apply_all(&self) -> Result<u64, RetentionError> {
        let policies = self
            .config_db
            .list_retention_policies()
            .map_err(|e| RetentionError::Failed(e.to_string()))?;
        let runs = policies
            .into_iter()
            .filter(|p| p.enabled)
            .map(|policy| self.apply_policy(policy));
        let results = futures_util::future::join_all(runs).await;
        let mut total = 0u64;
        for result in results {
            total += result?;
        }
        Ok(total)
    }

    /// Run one policy immediately, returning its deleted count.
    pub async fn apply(&self, policy_id: &str) -> Result<u64, RetentionError> {
        let policy = self
            .config_db
            .get_retention_policy(policy_id)
            .map_err(|e| RetentionError::Failed(e.to_string()))?
            .ok_or(RetentionError::NotFound)?;
        self.apply_policy(policy).await
    }

    async fn apply_policy(&self, policy: RetentionPolicy) -> Result<u64, RetentionError> {
        let now = chrono::Utc::now().timestamp_millis();
        let cutoff = now - policy.max_age_days as i64 * 86_400_000;

        let mut sources = if policy.apply_to_sources.is_empty() {
            self.index.sources()
        } else {
            policy.apply_to_sources.clone()
        };
        if sources.is_empty() {
            return Ok(0);
        }
        // Locks are taken in sorted order so two overlapping policies can
        // never deadlock against each other.
        sources.sort();
        sources.dedup();
        let mut guards = Vec::with_capacity(sources.len());
        for source in &sources {
            let lock = {
                let mut locks = self.source_locks.lock().unwrap();
                locks
                    .entry(source.clone())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                    .clone()
            };
            guards.push(lock.lock_owned().await);
        }

        let filter = DeleteFilter {
            before: cutoff,
            sources: Some(sources.iter().cloned().collect()),
        };
        let index = self.index.clone();
        let deleted = tokio::task::spawn_blocking(move || {
            let deleted = index.delete_where(&filter)?;
            if deleted > 0 {
                // Compact away the tombstones.
                index.housekeep();
            }
            Ok::<u64, crate::index::IndexError>(deleted)
        })
        .await
        .map_err(|e| RetentionError::Failed(e.to_string()))?
        .map_err(|e| RetentionError::Failed(e.to_string()))?;

        drop(guards);
        if deleted > 0 {
            tracing::info!(
                "retention policy '{}' deleted {deleted} record(s) older than {} day(s)",
                policy.name,
                policy.max_age_days
            );
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::FieldRegistry;
    use crate::index::IndexSettings;
    use crate::models::log::{LogLevel, LogRecord};
    use crate::models::shard::ShardConfiguration;
    use std::collections::BTreeMap;

    fn record(id: &str, ts: i64, source: &str) -> LogRecord {
        LogRecord {
            id: id.into(),
            timestamp: ts,
            level: LogLevel::Info,
            source: source.into(),
            message: "entry".into(),
            raw: None,
            fields: BTreeMap::new(),
            host: None,
        }
    }

    fn setup(dir: &std::path::Path) -> (Arc<ConfigDb>, Arc<IndexStore>, Arc<RetentionExecutor>) {
        let config_db =
            Arc::new(ConfigDb::open(dir.join("config.db").to_str().unwrap()).unwrap());
        let index = Arc::new(
            IndexStore::open(
                &dir.join("data"),
                &ShardConfiguration::default(),
                IndexSettings::default(),
                Arc::new(FieldRegistry::new(&[])),
            )
            .unwrap(),
        );
        let executor = Arc::new(RetentionExecutor::new(config_db.clone(), index.clone()));
        (config_db, index, executor)
    }

    #[tokio::test]
    async fn apply_deletes_only_targeted_old_records() {
        let dir = tempfile::tempdir().unwrap();
        let (config_db, index, executor) = setup(dir.path());
        let now = chrono::Utc::now().timestamp_millis();

        index
            .add_batch(vec![
                record("old-app", now - 2 * 86_400_000, "app.log"),
                record("new-app", now - 3_600_000, "app.log"),
                record("old-db", now - 2 * 86_400_000, "db.log"),
            ])
            .unwrap();

        config_db
            .create_retention_policy(&RetentionPolicy {
                id: "p1".into(),
                name: "app-1d".into(),
                max_age_days: 1,
                apply_to_sources: vec!["app.log".into()],
                enabled: true,
            })
            .unwrap();

        assert_eq!(executor.apply("p1").await.unwrap(), 1);
        assert_eq!(index.total_count(), 2);
        // Idempotent.
        assert_eq!(executor.apply("p1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn apply_all_covers_every_source_when_unscoped() {
        let dir = tempfile::tempdir().unwrap();
        let (config_db, index, executor) = setup(dir.path());
        let now = chrono::Utc::now().timestamp_millis();

        index
            .add_batch(vec![
                record("a", now - 5 * 86_400_000, "app.log"),
                record("b", now - 5 * 86_400_000, "db.log"),
                record("c", now - 3_600_000, "db.log"),
            ])
            .unwrap();

        config_db
            .create_retention_policy(&RetentionPolicy {
                id: "p1".into(),
                name: "everything-2d".into(),
                max_age_days: 2,
                apply_to_sources: Vec::new(),
                enabled: true,
            })
            .unwrap();
        // Disabled policies never run.
        config_db
            .create_retention_policy(&RetentionPolicy {
                id: "p2".into(),
                name: "aggressive-but-off".into(),
                max_age_days: 1,
                apply_to_sources: Vec::new(),
                enabled: false,
            })
            .unwrap();

        assert_eq!(executor.apply_all().await.unwrap(), 2);
        assert_eq!(index.total_count(), 1);
    }

    #[tokio::test]
    async fn missing_policy_reports_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (_config_db, _index, executor) = setup(dir.path());
        assert!(matches!(
            executor.apply("nope").await,
            Err(RetentionError::NotFound)
        ));
    }
}
