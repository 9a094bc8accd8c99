//! One physical shard: a directory of segments plus a manifest that lists
//! the live segment ids and the persisted tombstone set.
//!
//! Readers work on snapshots (`Arc<Segment>` clones taken under the read
//! lock); the write lock is held only while publishing a commit, marking
//! tombstones, or swapping in a merge result.

use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::IndexError;
use super::segment::{RecordId, Segment};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    segments: Vec<u64>,
    next_segment_id: u64,
    #[serde(default)]
    tombstones: Vec<RecordId>,
}

struct ShardInner {
    segments: Vec<Arc<Segment>>,
    tombstones: HashSet<RecordId>,
    next_segment_id: u64,
    out_of_sync: bool,
}

/// Consistent view for one search: segments and tombstones frozen at the
/// moment the search began.
#[derive(Clone)]
pub struct ShardSnapshot {
    pub segments: Vec<Arc<Segment>>,
    pub tombstones: Arc<HashSet<RecordId>>,
}

pub struct Shard {
    pub name: String,
    dir: PathBuf,
    inner: RwLock<ShardInner>,
}

impl Shard {
    /// Open (or create) the shard directory. Segments that fail to
    /// deserialize are renamed aside with a `.quarantined` suffix and the
    /// shard continues without them; the returned flag reports whether that
    /// happened.
    pub fn open(name: &str, dir: &Path) -> Result<(Shard, bool), IndexError> {
        std::fs::create_dir_all(dir)?;
        let manifest = read_manifest(dir)?;
        let mut degraded = false;

        let mut segments = Vec::with_capacity(manifest.segments.len());
        for id in &manifest.segments {
            let path = segment_path(dir, *id);
            match Segment::read_from(&path) {
                Ok(segment) => segments.push(Arc::new(segment)),
                Err(IndexError::Corrupt { reason, .. }) => {
                    let quarantine = path.with_extension("bin.quarantined");
                    tracing::error!(
                        "shard {name}: segment {id} corrupt ({reason}), quarantining to {}",
                        quarantine.display()
                    );
                    std::fs::rename(&path, &quarantine)?;
                    degraded = true;
                }
                Err(e) => return Err(e),
            }
        }

        let shard = Shard {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            inner: RwLock::new(ShardInner {
                segments,
                tombstones: manifest.tombstones.into_iter().collect(),
                next_segment_id: manifest.next_segment_id,
                out_of_sync: false,
            }),
        };
        Ok((shard, degraded))
    }

    pub fn snapshot(&self) -> ShardSnapshot {
        let inner = self.inner.read().unwrap();
        ShardSnapshot {
            segments: inner.segments.clone(),
            tombstones: Arc::new(inner.tombstones.clone()),
        }
    }

    pub fn allocate_segment_id(&self) -> u64 {
        let mut inner = self.inner.write().unwrap();
        let id = inner.next_segment_id;
        inner.next_segment_id += 1;
        id
    }

    pub fn segment_file(&self, id: u64) -> PathBuf {
        segment_path(&self.dir, id)
    }

    /// Write a prepared segment to disk without publishing it. Fsync
    /// failures are retried with exponential backoff up to `retries`.
    pub fn write_segment(
        &self,
        segment: &Segment,
        retries: u32,
    ) -> Result<(), IndexError> {
        let path = self.segment_file(segment.id);
        let mut backoff = Duration::from_millis(50);
        let mut attempt = 0u32;
        loop {
            match segment.write_to(&path) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < retries => {
                    attempt += 1;
                    tracing::warn!(
                        "shard {}: segment {} write failed (attempt {attempt}/{retries}): {e}",
                        self.name,
                        segment.id
                    );
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(Duration::from_secs(5));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Make a written segment visible to readers and persist the manifest.
    pub fn publish(&self, segment: Arc<Segment>) -> Result<(), IndexError> {
        let mut inner = self.inner.write().unwrap();
        inner.segments.push(segment);
        self.persist_manifest(&inner)
    }

    /// Remove the on-disk file of a prepared-but-unpublished segment.
    pub fn discard(&self, id: u64) {
        let _ = std::fs::remove_file(self.segment_file(id));
    }

    /// Tombstone every live record matching `matches`. Returns how many new
    /// tombstones were added (already-deleted records do not double-count).
    pub fn delete_matching(
        &self,
        matches: &dyn Fn(&crate::models::log::LogRecord) -> bool,
    ) -> Result<u64, IndexError> {
        let snapshot = self.snapshot();
        let mut doomed = Vec::new();
        for segment in &snapshot.segments {
            for row in &segment.rows {
                if !snapshot.tombstones.contains(&row.id) && matches(row) {
                    doomed.push(row.id.clone());
                }
            }
        }
        if doomed.is_empty() {
            return Ok(0);
        }
        let mut inner = self.inner.write().unwrap();
        let mut added = 0u64;
        for id in doomed {
            if inner.tombstones.insert(id) {
                added += 1;
            }
        }
        self.persist_manifest(&inner)?;
        Ok(added)
    }

    /// Merge all live segments into one when the shard is fragmented or has
    /// pending tombstones; purges tombstones. No-op otherwise.
    pub fn maybe_merge(&self, segment_threshold: usize, retries: u32) -> Result<bool, IndexError> {
        let (segments, tombstones) = {
            let inner = self.inner.read().unwrap();
            let fragmented = inner.segments.len() >= segment_threshold.max(2);
            let has_garbage = !inner.tombstones.is_empty() && !inner.segments.is_empty();
            if !fragmented && !has_garbage {
                return Ok(false);
            }
            (inner.segments.clone(), inner.tombstones.clone())
        };

        let merged_id = self.allocate_segment_id();
        let merged = super::segment::merge(merged_id, &segments, &tombstones);
        let old_ids: Vec<u64> = segments.iter().map(|s| s.id).collect();

        if merged.rows.is_empty() {
            // Everything was tombstoned; drop the segments outright.
            let mut inner = self.inner.write().unwrap();
            inner.segments.retain(|s| !old_ids.contains(&s.id));
            inner.tombstones.clear();
            self.persist_manifest(&inner)?;
            for id in old_ids {
                let _ = std::fs::remove_file(self.segment_file(id));
            }
            tracing::debug!("shard {}: merge emptied {} segment(s)", self.name, segments.len());
            return Ok(true);
        }

        self.write_segment(&merged, retries)?;
        let merged = Arc::new(merged);
        {
            let mut inner = self.inner.write().unwrap();
            inner.segments.retain(|s| !old_ids.contains(&s.id));
            inner.segments.push(merged);
            inner.tombstones.clear();
            self.persist_manifest(&inner)?;
        }
        for id in old_ids {
            let _ = std::fs::remove_file(self.segment_file(id));
        }
        tracing::debug!(
            "shard {}: merged {} segment(s) into segment {merged_id}",
            self.name,
            segments.len()
        );
        Ok(true)
    }

    pub fn is_out_of_sync(&self) -> bool {
        self.inner.read().unwrap().out_of_sync
    }

    pub fn mark_out_of_sync(&self) {
        self.inner.write().unwrap().out_of_sync = true;
        tracing::warn!("shard {}: marked out of sync", self.name);
    }

    /// Replace this replica's contents with a healthy peer's snapshot.
    pub fn resync_from(&self, peer: &Shard, retries: u32) -> Result<(), IndexError> {
        let peer_snapshot = peer.snapshot();
        let mut inner = self.inner.write().unwrap();

        for segment in &inner.segments {
            let _ = std::fs::remove_file(self.segment_file(segment.id));
        }
        for segment in &peer_snapshot.segments {
            let path = self.segment_file(segment.id);
            let mut backoff = Duration::from_millis(50);
            let mut attempt = 0u32;
            loop {
                match segment.write_to(&path) {
                    Ok(()) => break,
                    Err(e) if attempt < retries => {
                        attempt += 1;
                        std::thread::sleep(backoff);
                        backoff = (backoff * 2).min(Duration::from_secs(5));
                        tracing::warn!("shard {}: resync write retry {attempt}: {e}", self.name);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        inner.segments = peer_snapshot.segments.clone();
        inner.tombstones = (*peer_snapshot.tombstones).clone();
        inner.next_segment_id = inner
            .segments
            .iter()
            .map(|s| s.id + 1)
            .max()
            .unwrap_or(0)
            .max(inner.next_segment_id);
        inner.out_of_sync = false;
        self.persist_manifest(&inner)?;
        tracing::info!("shard {}: resynced from {}", self.name, peer.name);
        Ok(())
    }

    fn persist_manifest(&self, inner: &ShardInner) -> Result<(), IndexError> {
        let manifest = Manifest {
            segments: inner.segments.iter().map(|s| s.id).collect(),
            next_segment_id: inner.next_segment_id,
            tombstones: inner.tombstones.iter().cloned().collect(),
        };
        let path = self.dir.join("manifest.json");
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| IndexError::Encode(e.to_string()))?;
        std::fs::write(&tmp, data)?;
        File::open(&tmp)?.sync_all()?;
        std::fs::rename(&tmp, &path)?;
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }
}

fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("seg-{id}.bin"))
}

fn read_manifest(dir: &Path) -> Result<Manifest, IndexError> {
    let path = dir.join("manifest.json");
    if !path.exists() {
        return Ok(Manifest::default());
    }
    let data = std::fs::read(&path)?;
    serde_json::from_slice(&data).map_err(|e| IndexError::Corrupt {
        segment: path.display().to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::FieldCatalog;
    use crate::index::segment::SegmentBuilder;
    use crate::models::log::{LogLevel, LogRecord};
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

    fn commit(shard: &Shard, records: &[LogRecord]) {
        let catalog = FieldCatalog::default();
        let mut builder = SegmentBuilder::new(shard.allocate_segment_id(), true);
        for r in records {
            builder.push(r.clone());
        }
        let segment = builder.build(&catalog);
        shard.write_segment(&segment, 3).unwrap();
        shard.publish(Arc::new(segment)).unwrap();
    }

    #[test]
    fn publish_then_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (shard, degraded) = Shard::open("g0-r0", dir.path()).unwrap();
            assert!(!degraded);
            commit(&shard, &[record("a", 1, "hello"), record("b", 2, "world")]);
        }
        let (shard, degraded) = Shard::open("g0-r0", dir.path()).unwrap();
        assert!(!degraded);
        let snapshot = shard.snapshot();
        assert_eq!(snapshot.segments.len(), 1);
        assert_eq!(snapshot.segments[0].rows.len(), 2);
    }

    #[test]
    fn corrupt_segment_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (shard, _) = Shard::open("g0-r0", dir.path()).unwrap();
            commit(&shard, &[record("a", 1, "hello")]);
        }
        std::fs::write(dir.path().join("seg-0.bin"), b"garbage").unwrap();
        let (shard, degraded) = Shard::open("g0-r0", dir.path()).unwrap();
        assert!(degraded);
        assert!(shard.snapshot().segments.is_empty());
        assert!(dir.path().join("seg-0.bin.quarantined").exists());
    }

    #[test]
    fn delete_then_merge_purges() {
        let dir = tempfile::tempdir().unwrap();
        let (shard, _) = Shard::open("g0-r0", dir.path()).unwrap();
        commit(&shard, &[record("a", 1, "old entry")]);
        commit(&shard, &[record("b", 2, "new entry")]);

        let deleted = shard.delete_matching(&|r| r.timestamp < 2).unwrap();
        assert_eq!(deleted, 1);
        // Deleting again is idempotent.
        assert_eq!(shard.delete_matching(&|r| r.timestamp < 2).unwrap(), 0);

        assert!(shard.maybe_merge(100, 3).unwrap());
        let snapshot = shard.snapshot();
        assert_eq!(snapshot.segments.len(), 1);
        assert_eq!(snapshot.segments[0].rows.len(), 1);
        assert_eq!(snapshot.segments[0].rows[0].id, "b");
        assert!(snapshot.tombstones.is_empty());
    }

    #[test]
    fn resync_copies_peer_contents() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let (healthy, _) = Shard::open("g0-r0", dir_a.path()).unwrap();
        let (stale, _) = Shard::open("g0-r1", dir_b.path()).unwrap();
        commit(&healthy, &[record("a", 1, "replicated")]);

        stale.mark_out_of_sync();
        assert!(stale.is_out_of_sync());
        stale.resync_from(&healthy, 3).unwrap();
        assert!(!stale.is_out_of_sync());
        let snapshot = stale.snapshot();
        assert_eq!(snapshot.segments.len(), 1);
        assert!(snapshot.segments[0].contains_token("message", "replicated"));
    }
}
