//! Alarm evaluation: runs every enabled alarm's saved query over its time
//! window, compares the match count against the threshold, and walks the
//! TRIGGERED / ACKNOWLEDGED / RESOLVED state machine. Notifications are
//! best effort per channel; failures land in the event details and never
//! block other channels.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config_db::ConfigDb;
use crate::models::alarm::{Alarm, AlarmEvent, AlarmStatus};
use crate::notify::Notifier;
use crate::search::SearchExecutor;

pub struct AlarmEngine {
    config_db: Arc<ConfigDb>,
    search: SearchExecutor,
    notifier: Arc<Notifier>,
}

impl AlarmEngine {
    pub fn new(config_db: Arc<ConfigDb>, search: SearchExecutor, notifier: Arc<Notifier>) -> Self {
        Self {
            config_db,
            search,
            notifier,
        }
    }

    pub fn spawn(self: Arc<Self>, interval_secs: u64, shutdown: CancellationToken) {
        let engine = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = engine.eval_pass().await {
                            tracing::error!("alarm engine error: {e}");
                        }
                    }
                    _ = shutdown.cancelled() => {
                        tracing::info!("alarm engine stopped");
                        return;
                    }
                }
            }
        });
    }

    /// One evaluation pass over every enabled alarm. Public so on-demand
    /// evaluation (and tests) can drive it directly.
    pub async fn eval_pass(&self) -> anyhow::Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        for alarm in self.config_db.list_alarms()? {
            if !alarm.enabled {
                continue;
            }
            if let Err(e) = self.eval_alarm(&alarm, now).await {
                tracing::warn!("alarm '{}': evaluation failed: {e}", alarm.name);
            }
        }
        let stats = self.config_db.compute_alarm_statistics(now)?;
        self.config_db.save_alarm_statistics(&stats)?;
        Ok(())
    }

    async fn eval_alarm(&self, alarm: &Alarm, now: i64) -> anyhow::Result<()> {
        let plan = match self.search.parse_plan(&alarm.query, alarm.is_regex) {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!("alarm '{}': bad query: {e}", alarm.name);
                return Ok(());
            }
        };
        let window_ms = alarm.time_window_minutes as i64 * 60_000;
        let count = self.search.count(&plan, (now - window_ms, now))?;
        let firing = alarm.condition.holds(count, alarm.threshold);
        let throttle_ms = alarm.throttle_window_minutes as i64 * 60_000;

        let open = self.config_db.latest_open_event(&alarm.id)?;
        match (open, firing) {
            (None, true) => {
                // A firing that lands inside the throttle window of the
                // previous (resolved) event does not open a new one.
                if let Some(previous) = self.config_db.latest_event(&alarm.id)? {
                    if now - previous.triggered_at < throttle_ms {
                        tracing::debug!(
                            "alarm '{}': firing within throttle window of event {}, suppressed",
                            alarm.name,
                            previous.id
                        );
                        return Ok(());
                    }
                }
                let event = AlarmEvent {
                    id: uuid::Uuid::new_v4().to_string(),
                    alarm_id: alarm.id.clone(),
                    alarm_name: alarm.name.clone(),
                    status: AlarmStatus::Triggered,
                    triggered_at: now,
                    ack_at: None,
                    ack_by: None,
                    resolved_at: None,
                    match_count: count,
                    details: format!("{count} match(es)"),
                };
                self.config_db.create_alarm_event(&event)?;
                tracing::info!("alarm '{}' TRIGGERED ({count} match(es))", alarm.name);
                let details = self.dispatch_all(alarm, &event).await;
                self.config_db
                    .record_notification(&event.id, now, count, &details)?;
            }
            (Some((event, _)), false) => {
                self.config_db.resolve_event(&event.id, now)?;
                tracing::info!("alarm '{}' RESOLVED", alarm.name);
            }
            (Some((event, last_notified)), true) => {
                // Still firing. Acknowledged events stay silent until they
                // resolve; triggered ones re-notify once per throttle window.
                let due = last_notified
                    .map(|t| now - t >= throttle_ms)
                    .unwrap_or(true);
                if event.status == AlarmStatus::Triggered && due {
                    let mut renotify = event.clone();
                    renotify.match_count = count;
                    let details = self.dispatch_all(alarm, &renotify).await;
                    self.config_db
                        .record_notification(&event.id, now, count, &details)?;
                    tracing::info!(
                        "alarm '{}' still firing, re-notified ({count} match(es))",
                        alarm.name
                    );
                }
            }
            (None, false) => {}
        }
        Ok(())
    }

    /// Dispatch to every channel; per-channel outcomes are collected into
    /// the event details string.
    async fn dispatch_all(&self, alarm: &Alarm, event: &AlarmEvent) -> String {
        let mut failures = Vec::new();
        for (i, channel) in alarm.notification_channels.iter().enumerate() {
            if let Err(e) = self.notifier.dispatch(channel, alarm, event).await {
                tracing::warn!("alarm '{}': channel {i} dispatch failed: {e}", alarm.name);
                failures.push(format!("channel {i}: {e}"));
            }
        }
        if failures.is_empty() {
            format!("{} match(es)", event.match_count)
        } else {
            format!("{} match(es); {}", event.match_count, failures.join("; "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::FieldRegistry;
    use crate::index::{IndexSettings, IndexStore};
    use crate::models::alarm::AlarmCondition;
    use crate::models::log::{LogLevel, LogRecord};
    use crate::models::shard::ShardConfiguration;
    use crate::notify::{NotifySettings, SmtpConfig};
    use crate::search::SearchSettings;
    use std::collections::BTreeMap;

    fn record(id: &str, ts: i64, level: LogLevel) -> LogRecord {
        LogRecord {
            id: id.into(),
            timestamp: ts,
            level,
            source: "app.log".into(),
            message: "boom".into(),
            raw: None,
            fields: BTreeMap::new(),
            host: None,
        }
    }

    fn engine(dir: &std::path::Path) -> (Arc<ConfigDb>, Arc<IndexStore>, AlarmEngine) {
        let config_db =
            Arc::new(ConfigDb::open(dir.join("config.db").to_str().unwrap()).unwrap());
        let fields = Arc::new(FieldRegistry::new(&[]));
        let index = Arc::new(
            IndexStore::open(
                &dir.join("data"),
                &ShardConfiguration::default(),
                IndexSettings::default(),
                fields.clone(),
            )
            .unwrap(),
        );
        let search = SearchExecutor::new(index.clone(), fields, SearchSettings::default());
        let notifier = Arc::new(Notifier::new(&SmtpConfig::default(), NotifySettings::default()));
        let engine = AlarmEngine::new(config_db.clone(), search, notifier);
        (config_db, index, engine)
    }

    fn alarm(id: &str, query: &str, condition: AlarmCondition, threshold: u64) -> Alarm {
        Alarm {
            id: id.into(),
            name: id.into(),
            query: query.into(),
            is_regex: false,
            condition,
            threshold,
            time_window_minutes: 5,
            enabled: true,
            notification_channels: Vec::new(),
            throttle_window_minutes: 10,
        }
    }

    #[tokio::test]
    async fn rising_edge_creates_one_triggered_event() {
        let dir = tempfile::tempdir().unwrap();
        let (config_db, index, engine) = engine(dir.path());
        let now = chrono::Utc::now().timestamp_millis();

        index.add_batch(vec![record("r1", now - 1000, LogLevel::Error)]).unwrap();
        config_db
            .create_alarm(&alarm("errors", "level=ERROR", AlarmCondition::CountGt, 0))
            .unwrap();

        engine.eval_pass().await.unwrap();
        let events = config_db.list_alarm_events(10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, AlarmStatus::Triggered);
        assert_eq!(events[0].match_count, 1);

        // Still firing within the throttle window: no second event.
        engine.eval_pass().await.unwrap();
        assert_eq!(config_db.list_alarm_events(10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn falling_edge_resolves() {
        let dir = tempfile::tempdir().unwrap();
        let (config_db, index, engine) = engine(dir.path());
        let now = chrono::Utc::now().timestamp_millis();

        // count < 1 fires while the index has no FATAL records.
        config_db
            .create_alarm(&alarm("quiet", "level=FATAL", AlarmCondition::CountLt, 1))
            .unwrap();
        engine.eval_pass().await.unwrap();
        let (open, _) = config_db.latest_open_event("quiet").unwrap().unwrap();
        assert_eq!(open.status, AlarmStatus::Triggered);

        index.add_batch(vec![record("r1", now - 1000, LogLevel::Fatal)]).unwrap();
        engine.eval_pass().await.unwrap();
        assert!(config_db.latest_open_event("quiet").unwrap().is_none());
        let latest = config_db.latest_event("quiet").unwrap().unwrap();
        assert_eq!(latest.status, AlarmStatus::Resolved);
        assert!(latest.resolved_at.is_some());
    }

    #[tokio::test]
    async fn acknowledged_event_stays_silent() {
        let dir = tempfile::tempdir().unwrap();
        let (config_db, index, engine) = engine(dir.path());
        let now = chrono::Utc::now().timestamp_millis();

        index.add_batch(vec![record("r1", now - 1000, LogLevel::Error)]).unwrap();
        config_db
            .create_alarm(&alarm("errors", "level=ERROR", AlarmCondition::CountGt, 0))
            .unwrap();
        engine.eval_pass().await.unwrap();

        let (open, _) = config_db.latest_open_event("errors").unwrap().unwrap();
        assert!(config_db.acknowledge_event(&open.id, "alice", now).unwrap());
        engine.eval_pass().await.unwrap();
        let (still_open, _) = config_db.latest_open_event("errors").unwrap().unwrap();
        assert_eq!(still_open.status, AlarmStatus::Acknowledged);
        assert_eq!(still_open.id, open.id);
    }

    #[tokio::test]
    async fn disabled_alarms_are_skipped_and_stats_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let (config_db, index, engine) = engine(dir.path());
        let now = chrono::Utc::now().timestamp_millis();

        index.add_batch(vec![record("r1", now - 1000, LogLevel::Error)]).unwrap();
        let mut off = alarm("off", "level=ERROR", AlarmCondition::CountGt, 0);
        off.enabled = false;
        config_db.create_alarm(&off).unwrap();

        engine.eval_pass().await.unwrap();
        assert!(config_db.list_alarm_events(10).unwrap().is_empty());
        let stats = config_db.compute_alarm_statistics(now).unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.disabled, 1);
    }
}
