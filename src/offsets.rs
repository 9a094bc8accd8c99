//! Scanner offset state, persisted in `offsets.db`.
//!
//! Rows are keyed by file fingerprint so a rotated file's old state
//! survives (under its old fingerprint) until the grace period expires,
//! while the path maps to whichever state was seen most recently.

use std::collections::HashSet;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};

/// Tail state for one tracked file.
#[derive(Debug, Clone)]
pub struct FileOffsetState {
    pub fingerprint: String,
    pub path: String,
    /// First unread byte.
    pub offset: u64,
    pub last_modified: i64,
    /// Trailing bytes of an incomplete last line, carried to the next pass.
    pub partial: String,
    /// Highest record timestamp emitted from this file; later lines never
    /// go backwards.
    pub last_ts: i64,
    pub last_seen: i64,
}

pub struct OffsetStore {
    conn: Mutex<Connection>,
}

impl OffsetStore {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS file_offsets (
                fingerprint   TEXT PRIMARY KEY,
                path          TEXT NOT NULL,
                offset        INTEGER NOT NULL DEFAULT 0,
                last_modified INTEGER NOT NULL DEFAULT 0,
                partial       TEXT NOT NULL DEFAULT '',
                last_ts       INTEGER NOT NULL DEFAULT 0,
                last_seen     INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_file_offsets_path ON file_offsets(path, last_seen DESC);
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Most recently seen state for a path (there may be an older row for a
    /// rotated-away fingerprint).
    pub fn get_by_path(&self, path: &str) -> anyhow::Result<Option<FileOffsetState>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT fingerprint, path, offset, last_modified, partial, last_ts, last_seen
                 FROM file_offsets WHERE path = ?1 ORDER BY last_seen DESC LIMIT 1",
                params![path],
                map_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn upsert(&self, state: &FileOffsetState) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO file_offsets
                 (fingerprint, path, offset, last_modified, partial, last_ts, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(fingerprint) DO UPDATE SET
                 path = excluded.path,
                 offset = excluded.offset,
                 last_modified = excluded.last_modified,
                 partial = excluded.partial,
                 last_ts = excluded.last_ts,
                 last_seen = excluded.last_seen",
            params![
                state.fingerprint,
                state.path,
                state.offset as i64,
                state.last_modified,
                state.partial,
                state.last_ts,
                state.last_seen,
            ],
        )?;
        Ok(())
    }

    /// Refresh `last_seen` for files that are still present but had no new
    /// bytes this pass, so they do not age into the grace cutoff.
    pub fn touch(&self, fingerprint: &str, now: i64) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE file_offsets SET last_seen = ?2 WHERE fingerprint = ?1",
            params![fingerprint, now],
        )?;
        Ok(())
    }

    /// Drop state for files under `dir_prefix` that have not been observed
    /// for `grace_secs`. `live` holds the fingerprints seen in the pass
    /// that just finished; scoping to the directory keeps one config's
    /// pass from aging out another's state.
    pub fn prune(
        &self,
        dir_prefix: &str,
        live: &HashSet<String>,
        grace_secs: u64,
        now: i64,
    ) -> anyhow::Result<u64> {
        let cutoff = now - (grace_secs as i64) * 1000;
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT fingerprint FROM file_offsets WHERE last_seen < ?1 AND path LIKE ?2 || '%'",
        )?;
        let stale: Vec<String> = stmt
            .query_map(params![cutoff, dir_prefix], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        let mut removed = 0u64;
        for fingerprint in stale {
            if live.contains(&fingerprint) {
                continue;
            }
            removed += conn.execute(
                "DELETE FROM file_offsets WHERE fingerprint = ?1",
                params![fingerprint],
            )? as u64;
        }
        Ok(removed)
    }
}

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileOffsetState> {
    Ok(FileOffsetState {
        fingerprint: row.get(0)?,
        path: row.get(1)?,
        offset: row.get::<_, i64>(2)? as u64,
        last_modified: row.get(3)?,
        partial: row.get(4)?,
        last_ts: row.get(5)?,
        last_seen: row.get(6)?,
    })
}
