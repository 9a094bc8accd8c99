//! Durable configuration store backed by SQLite: directory configs, field
//! configurations, retention policies, alarms and their events, and the
//! grouped redaction config. Sub-structures (source lists, notification
//! channels) are stored as JSON in TEXT columns.

use rusqlite::{Connection, OptionalExtension, params};
use std::sync::Mutex;

use crate::models::alarm::{
    Alarm, AlarmCondition, AlarmEvent, AlarmStatistics, AlarmStatus, NotificationChannel,
};
use crate::models::directory::LogDirectoryConfig;
use crate::models::field::{FieldConfiguration, FieldType, SourceField};
use crate::models::retention::RetentionPolicy;
use crate::redaction::RedactionConfigMap;

pub struct ConfigDb {
    conn: Mutex<Connection>,
}

impl ConfigDb {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS log_directory_configs (
                id                    TEXT PRIMARY KEY,
                directory_path        TEXT NOT NULL,
                file_pattern          TEXT NOT NULL DEFAULT '*.log',
                scan_interval_seconds INTEGER NOT NULL DEFAULT 10,
                enabled               INTEGER NOT NULL DEFAULT 1,
                created_at            TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                updated_at            TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );

            CREATE TABLE IF NOT EXISTS field_configurations (
                id                 TEXT PRIMARY KEY,
                name               TEXT NOT NULL,
                source_field       TEXT NOT NULL CHECK(source_field IN ('message','level','source','raw')),
                extraction_pattern TEXT,
                field_type         TEXT NOT NULL CHECK(field_type IN ('STRING','NUMBER','DATE','BOOLEAN')),
                indexed            INTEGER NOT NULL DEFAULT 1,
                stored             INTEGER NOT NULL DEFAULT 1,
                tokenized          INTEGER NOT NULL DEFAULT 0,
                enabled            INTEGER NOT NULL DEFAULT 1,
                created_at         TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                updated_at         TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );

            CREATE TABLE IF NOT EXISTS retention_policies (
                id               TEXT PRIMARY KEY,
                name             TEXT NOT NULL,
                max_age_days     INTEGER NOT NULL CHECK(max_age_days >= 1),
                apply_to_sources TEXT NOT NULL DEFAULT '[]',
                enabled          INTEGER NOT NULL DEFAULT 1,
                created_at       TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                updated_at       TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );

            CREATE TABLE IF NOT EXISTS alarms (
                id                      TEXT PRIMARY KEY,
                name                    TEXT NOT NULL,
                query                   TEXT NOT NULL,
                is_regex                INTEGER NOT NULL DEFAULT 0,
                condition               TEXT NOT NULL CHECK(condition IN ('count >','count >=','count <','count <=')),
                threshold               INTEGER NOT NULL DEFAULT 0,
                time_window_minutes     INTEGER NOT NULL CHECK(time_window_minutes >= 1),
                enabled                 INTEGER NOT NULL DEFAULT 1,
                notification_channels   TEXT NOT NULL DEFAULT '[]',
                throttle_window_minutes INTEGER NOT NULL DEFAULT 10,
                created_at              TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                updated_at              TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );

            CREATE TABLE IF NOT EXISTS alarm_events (
                id               TEXT PRIMARY KEY,
                alarm_id         TEXT NOT NULL REFERENCES alarms(id) ON DELETE CASCADE,
                alarm_name       TEXT NOT NULL,
                status           TEXT NOT NULL CHECK(status IN ('TRIGGERED','ACKNOWLEDGED','RESOLVED')),
                triggered_at     INTEGER NOT NULL,
                ack_at           INTEGER,
                ack_by           TEXT,
                resolved_at      INTEGER,
                match_count      INTEGER NOT NULL DEFAULT 0,
                details          TEXT NOT NULL DEFAULT '',
                last_notified_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_alarm_events_alarm ON alarm_events(alarm_id, triggered_at DESC);

            CREATE TABLE IF NOT EXISTS redaction_config (
                id     INTEGER PRIMARY KEY CHECK(id = 1),
                config TEXT NOT NULL DEFAULT '{}'
            );

            CREATE TABLE IF NOT EXISTS alarm_statistics (
                id                            INTEGER PRIMARY KEY CHECK(id = 1),
                total                         INTEGER NOT NULL DEFAULT 0,
                enabled                       INTEGER NOT NULL DEFAULT 0,
                disabled                      INTEGER NOT NULL DEFAULT 0,
                recently_triggered_last_hour  INTEGER NOT NULL DEFAULT 0,
                updated_at                    TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );
            ",
        )?;
        Ok(())
    }

    // ── Directory configs ──

    pub fn list_directory_configs(&self) -> anyhow::Result<Vec<LogDirectoryConfig>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, directory_path, file_pattern, scan_interval_seconds, enabled
             FROM log_directory_configs ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map([], map_directory_config)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_directory_config(&self, id: &str) -> anyhow::Result<Option<LogDirectoryConfig>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, directory_path, file_pattern, scan_interval_seconds, enabled
                 FROM log_directory_configs WHERE id = ?1",
                params![id],
                map_directory_config,
            )
            .optional()?;
        Ok(row)
    }

    pub fn create_directory_config(&self, config: &LogDirectoryConfig) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO log_directory_configs
                 (id, directory_path, file_pattern, scan_interval_seconds, enabled)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                config.id,
                config.directory_path,
                config.file_pattern,
                config.scan_interval_seconds as i64,
                config.enabled,
            ],
        )?;
        Ok(())
    }

    pub fn update_directory_config(&self, config: &LogDirectoryConfig) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE log_directory_configs SET
                 directory_path = ?2, file_pattern = ?3, scan_interval_seconds = ?4,
                 enabled = ?5, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
             WHERE id = ?1",
            params![
                config.id,
                config.directory_path,
                config.file_pattern,
                config.scan_interval_seconds as i64,
                config.enabled,
            ],
        )?;
        Ok(updated > 0)
    }

    pub fn delete_directory_config(&self, id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM log_directory_configs WHERE id = ?1",
            params![id],
        )?;
        Ok(deleted > 0)
    }

    // ── Field configurations ──

    pub fn list_field_configurations(&self) -> anyhow::Result<Vec<FieldConfiguration>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, source_field, extraction_pattern, field_type,
                    indexed, stored, tokenized, enabled
             FROM field_configurations ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map([], map_field_configuration)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_field_configuration(&self, id: &str) -> anyhow::Result<Option<FieldConfiguration>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, name, source_field, extraction_pattern, field_type,
                        indexed, stored, tokenized, enabled
                 FROM field_configurations WHERE id = ?1",
                params![id],
                map_field_configuration,
            )
            .optional()?;
        Ok(row)
    }

    pub fn create_field_configuration(&self, config: &FieldConfiguration) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO field_configurations
                 (id, name, source_field, extraction_pattern, field_type,
                  indexed, stored, tokenized, enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                config.id,
                config.name,
                config.source_field.as_str(),
                config.extraction_pattern,
                config.field_type.as_str(),
                config.indexed,
                config.stored,
                config.tokenized,
                config.enabled,
            ],
        )?;
        Ok(())
    }

    pub fn update_field_configuration(&self, config: &FieldConfiguration) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE field_configurations SET
                 name = ?2, source_field = ?3, extraction_pattern = ?4, field_type = ?5,
                 indexed = ?6, stored = ?7, tokenized = ?8, enabled = ?9,
                 updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
             WHERE id = ?1",
            params![
                config.id,
                config.name,
                config.source_field.as_str(),
                config.extraction_pattern,
                config.field_type.as_str(),
                config.indexed,
                config.stored,
                config.tokenized,
                config.enabled,
            ],
        )?;
        Ok(updated > 0)
    }

    pub fn delete_field_configuration(&self, id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute("DELETE FROM field_configurations WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    // ── Retention policies ──

    pub fn list_retention_policies(&self) -> anyhow::Result<Vec<RetentionPolicy>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, max_age_days, apply_to_sources, enabled
             FROM retention_policies ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map([], map_retention_policy)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_retention_policy(&self, id: &str) -> anyhow::Result<Option<RetentionPolicy>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, name, max_age_days, apply_to_sources, enabled
                 FROM retention_policies WHERE id = ?1",
                params![id],
                map_retention_policy,
            )
            .optional()?;
        Ok(row)
    }

    pub fn create_retention_policy(&self, policy: &RetentionPolicy) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO retention_policies (id, name, max_age_days, apply_to_sources, enabled)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                policy.id,
                policy.name,
                policy.max_age_days,
                serde_json::to_string(&policy.apply_to_sources)?,
                policy.enabled,
            ],
        )?;
        Ok(())
    }

    pub fn update_retention_policy(&self, policy: &RetentionPolicy) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE retention_policies SET
                 name = ?2, max_age_days = ?3, apply_to_sources = ?4, enabled = ?5,
                 updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
             WHERE id = ?1",
            params![
                policy.id,
                policy.name,
                policy.max_age_days,
                serde_json::to_string(&policy.apply_to_sources)?,
                policy.enabled,
            ],
        )?;
        Ok(updated > 0)
    }

    pub fn delete_retention_policy(&self, id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute("DELETE FROM retention_policies WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    // ── Alarms ──

    pub fn list_alarms(&self) -> anyhow::Result<Vec<Alarm>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, query, is_regex, condition, threshold, time_window_minutes,
                    enabled, notification_channels, throttle_window_minutes
             FROM alarms ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map([], map_alarm)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_alarm(&self, id: &str) -> anyhow::Result<Option<Alarm>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, name, query, is_regex, condition, threshold, time_window_minutes,
                        enabled, notification_channels, throttle_window_minutes
                 FROM alarms WHERE id = ?1",
                params![id],
                map_alarm,
            )
            .optional()?;
        Ok(row)
    }

    pub fn create_alarm(&self, alarm: &Alarm) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO alarms
                 (id, name, query, is_regex, condition, threshold, time_window_minutes,
                  enabled, notification_channels, throttle_window_minutes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                alarm.id,
                alarm.name,
                alarm.query,
                alarm.is_regex,
                alarm.condition.as_str(),
                alarm.threshold as i64,
                alarm.time_window_minutes,
                alarm.enabled,
                serde_json::to_string(&alarm.notification_channels)?,
                alarm.throttle_window_minutes,
            ],
        )?;
        Ok(())
    }

    pub fn update_alarm(&self, alarm: &Alarm) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE alarms SET
                 name = ?2, query = ?3, is_regex = ?4, condition = ?5, threshold = ?6,
                 time_window_minutes = ?7, enabled = ?8, notification_channels = ?9,
                 throttle_window_minutes = ?10,
                 updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
             WHERE id = ?1",
            params![
                alarm.id,
                alarm.name,
                alarm.query,
                alarm.is_regex,
                alarm.condition.as_str(),
                alarm.threshold as i64,
                alarm.time_window_minutes,
                alarm.enabled,
                serde_json::to_string(&alarm.notification_channels)?,
                alarm.throttle_window_minutes,
            ],
        )?;
        Ok(updated > 0)
    }

    pub fn delete_alarm(&self, id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute("DELETE FROM alarms WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    pub fn set_alarm_enabled(&self, id: &str, enabled: bool) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE alarms SET enabled = ?2, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
             WHERE id = ?1",
            params![id, enabled],
        )?;
        Ok(updated > 0)
    }

    // ── Alarm events ──

    pub fn create_alarm_event(&self, event: &AlarmEvent) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO alarm_events
                 (id, alarm_id, alarm_name, status, triggered_at, ack_at, ack_by,
                  resolved_at, match_count, details, last_notified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                event.id,
                event.alarm_id,
                event.alarm_name,
                event.status.as_str(),
                event.triggered_at,
                event.ack_at,
                event.ack_by,
                event.resolved_at,
                event.match_count as i64,
                event.details,
                event.triggered_at,
            ],
        )?;
        Ok(())
    }

    pub fn list_alarm_events(&self, limit: u32) -> anyhow::Result<Vec<AlarmEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, alarm_id, alarm_name, status, triggered_at, ack_at, ack_by,
                    resolved_at, match_count, details
             FROM alarm_events ORDER BY triggered_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], map_alarm_event)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_alarm_event(&self, id: &str) -> anyhow::Result<Option<AlarmEvent>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, alarm_id, alarm_name, status, triggered_at, ack_at, ack_by,
                        resolved_at, match_count, details
                 FROM alarm_events WHERE id = ?1",
                params![id],
                map_alarm_event,
            )
            .optional()?;
        Ok(row)
    }

    /// Latest non-RESOLVED event for an alarm, with its last notification
    /// time (for throttling).
    pub fn latest_open_event(
        &self,
        alarm_id: &str,
    ) -> anyhow::Result<Option<(AlarmEvent, Option<i64>)>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, alarm_id, alarm_name, status, triggered_at, ack_at, ack_by,
                        resolved_at, match_count, details, last_notified_at
                 FROM alarm_events
                 WHERE alarm_id = ?1 AND status != 'RESOLVED'
                 ORDER BY triggered_at DESC LIMIT 1",
                params![alarm_id],
                |row| Ok((map_alarm_event(row)?, row.get::<_, Option<i64>>(10)?)),
            )
            .optional()?;
        Ok(row)
    }

    /// Latest event of any status, for throttle-window checks on
    /// re-triggering.
    pub fn latest_event(&self, alarm_id: &str) -> anyhow::Result<Option<AlarmEvent>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, alarm_id, alarm_name, status, triggered_at, ack_at, ack_by,
                        resolved_at, match_count, details
                 FROM alarm_events WHERE alarm_id = ?1
                 ORDER BY triggered_at DESC LIMIT 1",
                params![alarm_id],
                map_alarm_event,
            )
            .optional()?;
        Ok(row)
    }

    pub fn acknowledge_event(&self, id: &str, user: &str, at: i64) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE alarm_events SET status = 'ACKNOWLEDGED', ack_at = ?2, ack_by = ?3
             WHERE id = ?1 AND status = 'TRIGGERED'",
            params![id, at, user],
        )?;
        Ok(updated > 0)
    }

    pub fn resolve_event(&self, id: &str, at: i64) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE alarm_events SET status = 'RESOLVED', resolved_at = ?2
             WHERE id = ?1 AND status != 'RESOLVED'",
            params![id, at],
        )?;
        Ok(updated > 0)
    }

    pub fn record_notification(
        &self,
        event_id: &str,
        at: i64,
        match_count: u64,
        details: &str,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE alarm_events SET last_notified_at = ?2, match_count = ?3, details = ?4
             WHERE id = ?1",
            params![event_id, at, match_count as i64, details],
        )?;
        Ok(())
    }

    // ── Alarm statistics ──

    pub fn compute_alarm_statistics(&self, now: i64) -> anyhow::Result<AlarmStatistics> {
        let conn = self.conn.lock().unwrap();
        let (total, enabled): (u64, u64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(enabled), 0) FROM alarms",
            [],
            |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64)),
        )?;
        let hour_ago = now - 3_600_000;
        let recent: u64 = conn.query_row(
            "SELECT COUNT(*) FROM alarm_events WHERE triggered_at >= ?1",
            params![hour_ago],
            |row| row.get::<_, i64>(0).map(|v| v as u64),
        )?;
        Ok(AlarmStatistics {
            total,
            enabled,
            disabled: total - enabled,
            recently_triggered_last_hour: recent,
        })
    }

    pub fn save_alarm_statistics(&self, stats: &AlarmStatistics) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO alarm_statistics (id, total, enabled, disabled, recently_triggered_last_hour)
             VALUES (1, ?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                 total = excluded.total,
                 enabled = excluded.enabled,
                 disabled = excluded.disabled,
                 recently_triggered_last_hour = excluded.recently_triggered_last_hour,
                 updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')",
            params![
                stats.total as i64,
                stats.enabled as i64,
                stats.disabled as i64,
                stats.recently_triggered_last_hour as i64,
            ],
        )?;
        Ok(())
    }

    // ── Redaction config ──

    pub fn get_redaction_config(&self) -> anyhow::Result<RedactionConfigMap> {
        let conn = self.conn.lock().unwrap();
        let json: Option<String> = conn
            .query_row("SELECT config FROM redaction_config WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        match json {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(RedactionConfigMap::new()),
        }
    }

    pub fn set_redaction_config(&self, config: &RedactionConfigMap) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO redaction_config (id, config) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET config = excluded.config",
            params![serde_json::to_string(config)?],
        )?;
        Ok(())
    }
}

fn map_directory_config(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogDirectoryConfig> {
    Ok(LogDirectoryConfig {
        id: row.get(0)?,
        directory_path: row.get(1)?,
        file_pattern: row.get(2)?,
        scan_interval_seconds: row.get::<_, i64>(3)? as u64,
        enabled: row.get(4)?,
    })
}

fn map_field_configuration(row: &rusqlite::Row<'_>) -> rusqlite::Result<FieldConfiguration> {
    let source_field: String = row.get(2)?;
    let field_type: String = row.get(4)?;
    Ok(FieldConfiguration {
        id: row.get(0)?,
        name: row.get(1)?,
        source_field: SourceField::parse(&source_field).unwrap_or(SourceField::Message),
        extraction_pattern: row.get(3)?,
        field_type: FieldType::parse(&field_type).unwrap_or(FieldType::String),
        indexed: row.get(5)?,
        stored: row.get(6)?,
        tokenized: row.get(7)?,
        enabled: row.get(8)?,
    })
}

fn map_retention_policy(row: &rusqlite::Row<'_>) -> rusqlite::Result<RetentionPolicy> {
    let sources: String = row.get(3)?;
    Ok(RetentionPolicy {
        id: row.get(0)?,
        name: row.get(1)?,
        max_age_days: row.get(2)?,
        apply_to_sources: serde_json::from_str(&sources).unwrap_or_default(),
        enabled: row.get(4)?,
    })
}

fn map_alarm(row: &rusqlite::Row<'_>) -> rusqlite::Result<Alarm> {
    let condition: String = row.get(4)?;
    let channels: String = row.get(8)?;
    Ok(Alarm {
        id: row.get(0)?,
        name: row.get(1)?,
        query: row.get(2)?,
        is_regex: row.get(3)?,
        condition: AlarmCondition::parse(&condition).unwrap_or(AlarmCondition::CountGt),
        threshold: row.get::<_, i64>(5)? as u64,
        time_window_minutes: row.get(6)?,
        enabled: row.get(7)?,
        notification_channels: serde_json::from_str::<Vec<NotificationChannel>>(&channels)
            .unwrap_or_default(),
        throttle_window_minutes: row.get(9)?,
    })
}

fn map_alarm_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<AlarmEvent> {
    let status: String = row.get(3)?;
    Ok(AlarmEvent {
        id: row.get(0)?,
        alarm_id: row.get(1)?,
        alarm_name: row.get(2)?,
        status: AlarmStatus::parse(&status).unwrap_or(AlarmStatus::Triggered),
        triggered_at: row.get(4)?,
        ack_at: row.get(5)?,
        ack_by: row.get(6)?,
        resolved_at: row.get(7)?,
        match_count: row.get::<_, i64>(8)? as u64,
        details: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::alarm::SyslogProtocol;

    fn db() -> (tempfile::TempDir, ConfigDb) {
        let dir = tempfile::tempdir().unwrap();
        let db = ConfigDb::open(dir.path().join("config.db").to_str().unwrap()).unwrap();
        (dir, db)
    }

    fn alarm(id: &str) -> Alarm {
        Alarm {
            id: id.into(),
            name: "errors".into(),
            query: "level=ERROR".into(),
            is_regex: false,
            condition: AlarmCondition::CountGt,
            threshold: 0,
            time_window_minutes: 5,
            enabled: true,
            notification_channels: Vec::new(),
            throttle_window_minutes: 10,
        }
    }

    #[test]
    fn directory_config_crud() {
        let (_dir, db) = db();
        let config = LogDirectoryConfig {
            id: "d1".into(),
            directory_path: "/var/log".into(),
            file_pattern: "*.log".into(),
            scan_interval_seconds: 30,
            enabled: true,
        };
        db.create_directory_config(&config).unwrap();
        assert_eq!(db.list_directory_configs().unwrap().len(), 1);

        let mut updated = config.clone();
        updated.scan_interval_seconds = 60;
        assert!(db.update_directory_config(&updated).unwrap());
        assert_eq!(
            db.get_directory_config("d1").unwrap().unwrap().scan_interval_seconds,
            60
        );
        assert!(db.delete_directory_config("d1").unwrap());
        assert!(!db.delete_directory_config("d1").unwrap());
    }

    #[test]
    fn alarm_round_trips_channels() {
        let (_dir, db) = db();
        let mut a = alarm("a1");
        a.notification_channels = vec![
            NotificationChannel::Email {
                addr: "ops@example.com".into(),
            },
            NotificationChannel::Syslog {
                host: "loghost".into(),
                port: 514,
                protocol: SyslogProtocol::Udp,
                facility: 1,
            },
        ];
        db.create_alarm(&a).unwrap();
        let loaded = db.get_alarm("a1").unwrap().unwrap();
        assert_eq!(loaded.notification_channels.len(), 2);
        assert_eq!(loaded.condition, AlarmCondition::CountGt);

        assert!(db.set_alarm_enabled("a1", false).unwrap());
        assert!(!db.get_alarm("a1").unwrap().unwrap().enabled);
    }

    #[test]
    fn alarm_event_lifecycle() {
        let (_dir, db) = db();
        db.create_alarm(&alarm("a1")).unwrap();

        let event = AlarmEvent {
            id: "e1".into(),
            alarm_id: "a1".into(),
            alarm_name: "errors".into(),
            status: AlarmStatus::Triggered,
            triggered_at: 1000,
            ack_at: None,
            ack_by: None,
            resolved_at: None,
            match_count: 3,
            details: "3 match(es)".into(),
        };
        db.create_alarm_event(&event).unwrap();

        let (open, last_notified) = db.latest_open_event("a1").unwrap().unwrap();
        assert_eq!(open.id, "e1");
        assert_eq!(last_notified, Some(1000));

        assert!(db.acknowledge_event("e1", "alice", 2000).unwrap());
        // Acknowledging twice is a no-op.
        assert!(!db.acknowledge_event("e1", "bob", 3000).unwrap());
        let (open, _) = db.latest_open_event("a1").unwrap().unwrap();
        assert_eq!(open.status, AlarmStatus::Acknowledged);
        assert_eq!(open.ack_by.as_deref(), Some("alice"));

        assert!(db.resolve_event("e1", 4000).unwrap());
        assert!(db.latest_open_event("a1").unwrap().is_none());
        // RESOLVED is terminal.
        assert!(!db.resolve_event("e1", 5000).unwrap());
        assert_eq!(
            db.latest_event("a1").unwrap().unwrap().status,
            AlarmStatus::Resolved
        );
    }

    #[test]
    fn statistics_compute_and_persist() {
        let (_dir, db) = db();
        db.create_alarm(&alarm("a1")).unwrap();
        let mut second = alarm("a2");
        second.enabled = false;
        db.create_alarm(&second).unwrap();

        let stats = db.compute_alarm_statistics(10_000_000).unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.enabled, 1);
        assert_eq!(stats.disabled, 1);
        db.save_alarm_statistics(&stats).unwrap();
    }

    #[test]
    fn redaction_config_round_trip() {
        let (_dir, db) = db();
        assert!(db.get_redaction_config().unwrap().is_empty());
        let mut config = RedactionConfigMap::new();
        config.insert(
            "message".into(),
            crate::redaction::RedactionGroup {
                patterns: vec![r"password=\S+".into()],
            },
        );
        db.set_redaction_config(&config).unwrap();
        let loaded = db.get_redaction_config().unwrap();
        assert_eq!(loaded["message"].patterns.len(), 1);
    }
}
