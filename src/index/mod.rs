//! The index store: a set of shard groups (each group replicated when
//! configured), an inverted index per segment, and a row store addressed by
//! record id. Writers prepare segment files for every replica of every
//! touched group, then publish them together; a batch either becomes
//! searchable everywhere or is rejected. Readers take snapshots and never
//! block writers.

pub mod router;
pub mod segment;
pub mod shard;

use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::fields::FieldRegistry;
use crate::models::log::LogRecord;
use crate::models::shard::ShardConfiguration;

use router::ShardRouter;
use segment::{Segment, SegmentBuilder};
use shard::{Shard, ShardSnapshot};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("segment encode failed: {0}")]
    Encode(String),
    #[error("segment {segment} corrupt: {reason}")]
    Corrupt { segment: String, reason: String },
    #[error("write quorum failed for shard group {group}")]
    QuorumFailed { group: usize },
}

#[derive(Debug, Clone)]
pub struct IndexSettings {
    /// Fsync retry attempts before a write is reported as failed.
    pub fsync_retries: u32,
    /// Segment count per shard that triggers a background merge.
    pub merge_segment_threshold: usize,
    /// Keep the pre-redaction raw line in the row store.
    pub store_raw: bool,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            fsync_retries: 3,
            merge_segment_threshold: 8,
            store_raw: true,
        }
    }
}

struct ShardGroup {
    replicas: Vec<Shard>,
}

impl ShardGroup {
    /// Read quorum is 1: any in-sync replica answers.
    fn read_replica(&self) -> &Shard {
        self.replicas
            .iter()
            .find(|r| !r.is_out_of_sync())
            .unwrap_or(&self.replicas[0])
    }
}

pub struct IndexStore {
    settings: IndexSettings,
    router: ShardRouter,
    groups: Vec<ShardGroup>,
    fields: Arc<FieldRegistry>,
    degraded: AtomicBool,
}

/// Filter for retention deletes: strictly-older-than cutoff, optionally
/// restricted to a source set.
pub struct DeleteFilter {
    pub before: i64,
    pub sources: Option<HashSet<String>>,
}

impl DeleteFilter {
    pub fn matches(&self, record: &LogRecord) -> bool {
        record.timestamp < self.before
            && self
                .sources
                .as_ref()
                .is_none_or(|sources| sources.contains(&record.source))
    }
}

impl IndexStore {
    /// Open every shard replica under `<dir>/shards/g<g>-r<r>`. Corrupt
    /// segments are quarantined and leave the store in a degraded (but
    /// serving) state.
    pub fn open(
        dir: &Path,
        shard_config: &ShardConfiguration,
        settings: IndexSettings,
        fields: Arc<FieldRegistry>,
    ) -> Result<Self, IndexError> {
        let router = ShardRouter::new(shard_config);
        let replica_count = shard_config.replica_count();
        let mut groups = Vec::with_capacity(router.group_count());
        let mut degraded = false;

        for g in 0..router.group_count() {
            let mut replicas = Vec::with_capacity(replica_count);
            for r in 0..replica_count {
                let name = format!("g{g}-r{r}");
                let (shard, shard_degraded) = Shard::open(&name, &dir.join("shards").join(&name))?;
                degraded |= shard_degraded;
                replicas.push(shard);
            }
            groups.push(ShardGroup { replicas });
        }

        if degraded {
            tracing::warn!("index opened in degraded state (quarantined segments present)");
        }
        Ok(Self {
            settings,
            router,
            groups,
            fields,
            degraded: AtomicBool::new(degraded),
        })
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn router(&self) -> &ShardRouter {
        &self.router
    }

    /// Commit one batch. All records become searchable or none do: segment
    /// files are prepared for every replica first and only published once
    /// every group reached its write quorum (majority of replicas).
    pub fn add_batch(&self, records: Vec<LogRecord>) -> Result<usize, IndexError> {
        if records.is_empty() {
            return Ok(0);
        }
        let total = records.len();
        let catalog = self.fields.snapshot();

        let mut per_group: HashMap<usize, Vec<LogRecord>> = HashMap::new();
        for record in records {
            per_group
                .entry(self.router.route(&record))
                .or_default()
                .push(record);
        }

        // Prepare phase: one segment file per replica of each touched group.
        struct Prepared {
            group: usize,
            replica: usize,
            segment: Arc<Segment>,
        }
        let mut prepared: Vec<Prepared> = Vec::new();
        let mut failed: Vec<(usize, usize)> = Vec::new();

        for (&group_idx, group_records) in &per_group {
            let group = &self.groups[group_idx];
            let mut successes = 0usize;
            for (replica_idx, replica) in group.replicas.iter().enumerate() {
                let mut builder =
                    SegmentBuilder::new(replica.allocate_segment_id(), self.settings.store_raw);
                for record in group_records {
                    builder.push(record.clone());
                }
                let segment = builder.build(&catalog);
                match replica.write_segment(&segment, self.settings.fsync_retries) {
                    Ok(()) => {
                        successes += 1;
                        prepared.push(Prepared {
                            group: group_idx,
                            replica: replica_idx,
                            segment: Arc::new(segment),
                        });
                    }
                    Err(e) => {
                        tracing::error!(
                            "shard {}: segment write failed after retries: {e}",
                            replica.name
                        );
                        replica.discard(segment.id);
                        failed.push((group_idx, replica_idx));
                    }
                }
            }
            let quorum = group.replicas.len() / 2 + 1;
            if successes < quorum {
                for p in &prepared {
                    self.groups[p.group].replicas[p.replica].discard(p.segment.id);
                }
                return Err(IndexError::QuorumFailed { group: group_idx });
            }
        }

        // Publish phase: quorum held everywhere, make the batch visible.
        for p in prepared {
            let replica = &self.groups[p.group].replicas[p.replica];
            if let Err(e) = replica.publish(p.segment) {
                tracing::error!("shard {}: publish failed: {e}", replica.name);
                replica.mark_out_of_sync();
            }
        }
        for (group_idx, replica_idx) in failed {
            self.groups[group_idx].replicas[replica_idx].mark_out_of_sync();
        }
        Ok(total)
    }

    /// Tombstone matching records everywhere. Returns the logical deleted
    /// count (counted once per group, not per replica).
    pub fn delete_where(&self, filter: &DeleteFilter) -> Result<u64, IndexError> {
        let mut deleted = 0u64;
        for group in &self.groups {
            let mut group_deleted = 0u64;
            for (i, replica) in group.replicas.iter().enumerate() {
                let count = replica.delete_matching(&|r| filter.matches(r))?;
                if i == 0 {
                    group_deleted = count;
                }
            }
            deleted += group_deleted;
        }
        Ok(deleted)
    }

    /// Snapshot the read replicas of the given groups (all groups when the
    /// caller has no routing information).
    pub fn snapshot(&self, groups: Option<&[usize]>) -> IndexSnapshot {
        let shards = match groups {
            Some(ids) => ids
                .iter()
                .filter_map(|&g| self.groups.get(g))
                .map(|g| g.read_replica().snapshot())
                .collect(),
            None => self
                .groups
                .iter()
                .map(|g| g.read_replica().snapshot())
                .collect(),
        };
        IndexSnapshot { shards }
    }

    pub fn sources(&self) -> Vec<String> {
        let mut out = BTreeSet::new();
        for shard in &self.snapshot(None).shards {
            for segment in &shard.segments {
                out.extend(segment.sources.iter().cloned());
            }
        }
        out.into_iter().collect()
    }

    pub fn levels(&self) -> Vec<String> {
        let mut out = BTreeSet::new();
        for shard in &self.snapshot(None).shards {
            for segment in &shard.segments {
                out.extend(segment.levels.iter().cloned());
            }
        }
        out.into_iter().collect()
    }

    /// Known field names: built-ins plus everything seen in segments.
    pub fn fields(&self) -> Vec<String> {
        let mut out: BTreeSet<String> = ["timestamp", "level", "source", "message", "host"]
            .into_iter()
            .map(String::from)
            .collect();
        for shard in &self.snapshot(None).shards {
            for segment in &shard.segments {
                out.extend(segment.field_names.iter().cloned());
            }
        }
        out.into_iter().collect()
    }

    pub fn total_count(&self) -> u64 {
        let mut total = 0u64;
        for shard in &self.snapshot(None).shards {
            for segment in &shard.segments {
                total += segment
                    .rows
                    .iter()
                    .filter(|r| !shard.tombstones.contains(&r.id))
                    .count() as u64;
            }
        }
        total
    }

    /// Run merges and replica resyncs once. Called periodically by the
    /// housekeeping task and after retention deletes.
    pub fn housekeep(&self) {
        for group in &self.groups {
            for replica in &group.replicas {
                if replica.is_out_of_sync() {
                    if let Some(peer) = group
                        .replicas
                        .iter()
                        .find(|p| !p.is_out_of_sync() && p.name != replica.name)
                    {
                        if let Err(e) = replica.resync_from(peer, self.settings.fsync_retries) {
                            tracing::error!("shard {}: resync failed: {e}", replica.name);
                        }
                        continue;
                    }
                }
                if let Err(e) = replica.maybe_merge(
                    self.settings.merge_segment_threshold,
                    self.settings.fsync_retries,
                ) {
                    tracing::error!("shard {}: merge failed: {e}", replica.name);
                }
            }
        }
    }
}

/// Spawn the background merge/resync loop.
pub fn spawn_housekeeping(
    store: Arc<IndexStore>,
    interval_secs: u64,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let store = store.clone();
                    let _ = tokio::task::spawn_blocking(move || store.housekeep()).await;
                }
                _ = shutdown.cancelled() => {
                    tracing::debug!("index housekeeping stopped");
                    return;
                }
            }
        }
    });
}

/// A token clause used to skip whole segments: the conjunction of clauses
/// must hold for a record to match, each clause being a disjunction of
/// (field, token) alternatives.
pub type TokenClauses = Vec<Vec<(String, String)>>;

/// Frozen multi-shard view for one search.
pub struct IndexSnapshot {
    pub shards: Vec<ShardSnapshot>,
}

impl IndexSnapshot {
    /// Iterate records in `[from, to]` matching `pred`, newest first with
    /// record-id tie-break, lazily merged across shards and segments.
    /// Segments whose time range or term dictionary cannot satisfy the
    /// query are skipped without being scanned.
    pub fn search<'a, F>(
        &'a self,
        from: i64,
        to: i64,
        clauses: &TokenClauses,
        pred: F,
    ) -> MergeIter<'a, F>
    where
        F: Fn(&LogRecord) -> bool,
    {
        let mut sources: Vec<SegmentCursor<'a>> = Vec::new();
        for shard in &self.shards {
            for segment in &shard.segments {
                if !segment.overlaps(from, to) {
                    continue;
                }
                let satisfiable = clauses.iter().all(|clause| {
                    clause
                        .iter()
                        .any(|(field, token)| segment.contains_token(field, token))
                });
                if !satisfiable {
                    continue;
                }
                sources.push(SegmentCursor {
                    segment,
                    tombstones: &shard.tombstones,
                    next: 0,
                });
            }
        }
        MergeIter::new(sources, from, to, pred)
    }

    /// Histogram over `[from, to)` with `bucket_ms`-wide buckets aligned to
    /// UTC epoch multiples. Empty buckets are included.
    pub fn histogram<F>(
        &self,
        from: i64,
        to: i64,
        bucket_ms: i64,
        clauses: &TokenClauses,
        pred: F,
    ) -> Vec<(i64, u64)>
    where
        F: Fn(&LogRecord) -> bool,
    {
        let mut buckets = histogram_skeleton(from, to, bucket_ms);
        let first_bucket = buckets.first().map(|(start, _)| *start).unwrap_or(0);
        for record in self.search(from, to, clauses, pred) {
            let idx = (record.timestamp - first_bucket).div_euclid(bucket_ms) as usize;
            if let Some(bucket) = buckets.get_mut(idx) {
                bucket.1 += 1;
            }
        }
        buckets
    }
}

/// All buckets covering `[from, to]`, aligned down to multiples of
/// `bucket_ms`, counts zeroed.
pub fn histogram_skeleton(from: i64, to: i64, bucket_ms: i64) -> Vec<(i64, u64)> {
    if bucket_ms <= 0 || to < from {
        return Vec::new();
    }
    let mut start = from.div_euclid(bucket_ms) * bucket_ms;
    let mut buckets = Vec::new();
    while start <= to {
        buckets.push((start, 0));
        start += bucket_ms;
    }
    buckets
}

struct SegmentCursor<'a> {
    segment: &'a Segment,
    tombstones: &'a HashSet<String>,
    next: usize,
}

struct HeapEntry<'a> {
    timestamp: i64,
    id: &'a str,
    source_idx: usize,
}

impl PartialEq for HeapEntry<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp && self.id == other.id
    }
}
impl Eq for HeapEntry<'_> {}
impl PartialOrd for HeapEntry<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry<'_> {
    // Max-heap: newest timestamp first, ties by record id descending.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.id.cmp(other.id))
    }
}

pub struct MergeIter<'a, F: Fn(&LogRecord) -> bool> {
    sources: Vec<SegmentCursor<'a>>,
    heap: BinaryHeap<HeapEntry<'a>>,
    from: i64,
    to: i64,
    pred: F,
}

impl<'a, F: Fn(&LogRecord) -> bool> MergeIter<'a, F> {
    fn new(sources: Vec<SegmentCursor<'a>>, from: i64, to: i64, pred: F) -> Self {
        let mut iter = Self {
            sources,
            heap: BinaryHeap::new(),
            from,
            to,
            pred,
        };
        for idx in 0..iter.sources.len() {
            iter.advance(idx);
        }
        iter
    }

    /// Move cursor `idx` to its next acceptable row and push it on the heap.
    fn advance(&mut self, idx: usize) {
        let segment: &'a Segment = self.sources[idx].segment;
        let tombstones: &'a HashSet<String> = self.sources[idx].tombstones;
        loop {
            let next = self.sources[idx].next;
            let Some(row) = segment.rows.get(next) else {
                return;
            };
            self.sources[idx].next = next + 1;
            // Rows are sorted newest-first; everything past the lower bound
            // is out of range for good.
            if row.timestamp < self.from {
                self.sources[idx].next = segment.rows.len();
                return;
            }
            if row.timestamp > self.to || tombstones.contains(&row.id) {
                continue;
            }
            if !(self.pred)(row) {
                continue;
            }
            self.heap.push(HeapEntry {
                timestamp: row.timestamp,
                id: &row.id,
                source_idx: idx,
            });
            return;
        }
    }
}

impl<'a, F: Fn(&LogRecord) -> bool> Iterator for MergeIter<'a, F> {
    type Item = &'a LogRecord;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.heap.pop()?;
        let source_idx = entry.source_idx;
        let segment: &'a Segment = self.sources[source_idx].segment;
        // The entry refers to the row just before the cursor position.
        let row: &'a LogRecord = &segment.rows[self.sources[source_idx].next - 1];
        self.advance(source_idx);
        Some(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::log::LogLevel;
    use crate::models::shard::ShardingType;
    use std::collections::BTreeMap;

    fn registry() -> Arc<FieldRegistry> {
        Arc::new(FieldRegistry::new(&[]))
    }

    fn record(id: &str, ts: i64, source: &str, message: &str) -> LogRecord {
        LogRecord {
            id: id.into(),
            timestamp: ts,
            level: LogLevel::Info,
            source: source.into(),
            message: message.into(),
            raw: None,
            fields: BTreeMap::new(),
            host: None,
        }
    }

    fn open_store(dir: &Path) -> IndexStore {
        IndexStore::open(
            dir,
            &ShardConfiguration::default(),
            IndexSettings::default(),
            registry(),
        )
        .unwrap()
    }

    #[test]
    fn add_then_search_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store
            .add_batch(vec![
                record("a", 100, "app.log", "hello world"),
                record("b", 300, "app.log", "goodbye world"),
            ])
            .unwrap();
        store
            .add_batch(vec![record("c", 200, "app.log", "middle world")])
            .unwrap();

        let snapshot = store.snapshot(None);
        let ids: Vec<&str> = snapshot
            .search(0, 1000, &Vec::new(), |_| true)
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn token_clauses_skip_segments() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store
            .add_batch(vec![record("a", 1, "app.log", "alpha only")])
            .unwrap();
        store
            .add_batch(vec![record("b", 2, "app.log", "beta only")])
            .unwrap();

        let snapshot = store.snapshot(None);
        let clauses = vec![vec![("message".to_string(), "alpha".to_string())]];
        let hits: Vec<&str> = snapshot
            .search(0, 10, &clauses, |r| r.message.contains("alpha"))
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(hits, vec!["a"]);
    }

    #[test]
    fn delete_where_respects_source_and_cutoff() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store
            .add_batch(vec![
                record("old-app", 100, "app.log", "x"),
                record("old-db", 100, "db.log", "x"),
                record("new-app", 900, "app.log", "x"),
            ])
            .unwrap();

        let filter = DeleteFilter {
            before: 500,
            sources: Some(["app.log".to_string()].into_iter().collect()),
        };
        assert_eq!(store.delete_where(&filter).unwrap(), 1);
        // Idempotent.
        assert_eq!(store.delete_where(&filter).unwrap(), 0);
        assert_eq!(store.total_count(), 2);

        let snapshot = store.snapshot(None);
        let ids: Vec<&str> = snapshot
            .search(0, 1000, &Vec::new(), |_| true)
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(ids, vec!["new-app", "old-db"]);
    }

    #[test]
    fn histogram_conserves_total() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let mut batch = Vec::new();
        for i in 0..10 {
            batch.push(record(&format!("r{i}"), i * 1000, "app.log", "tick"));
        }
        store.add_batch(batch).unwrap();

        let snapshot = store.snapshot(None);
        let buckets = snapshot.histogram(0, 9999, 2500, &Vec::new(), |_| true);
        assert_eq!(buckets.len(), 4);
        assert!(buckets.iter().all(|(start, _)| start % 2500 == 0));
        let total: u64 = buckets.iter().map(|(_, c)| c).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn degenerate_histogram_single_bucket() {
        let skeleton = histogram_skeleton(0, 999, 1000);
        assert_eq!(skeleton, vec![(0, 0)]);
    }

    #[test]
    fn replicated_store_survives_and_reads() {
        let dir = tempfile::tempdir().unwrap();
        let config = ShardConfiguration {
            sharding_type: ShardingType::SourceBased,
            number_of_shards: 2,
            replication_enabled: true,
            replication_factor: 2,
            sharding_enabled: true,
            ..ShardConfiguration::default()
        };
        let store = IndexStore::open(
            dir.path(),
            &config,
            IndexSettings::default(),
            registry(),
        )
        .unwrap();
        store
            .add_batch(vec![
                record("a", 1, "app.log", "replicated entry"),
                record("b", 2, "db.log", "replicated entry"),
            ])
            .unwrap();
        assert_eq!(store.total_count(), 2);

        let snapshot = store.snapshot(None);
        let hits = snapshot.search(0, 10, &Vec::new(), |_| true).count();
        assert_eq!(hits, 2);
    }

    #[test]
    fn catalogs_enumerate() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store
            .add_batch(vec![
                record("a", 1, "app.log", "x"),
                record("b", 2, "db.log", "y"),
            ])
            .unwrap();
        assert_eq!(store.sources(), vec!["app.log", "db.log"]);
        assert_eq!(store.levels(), vec!["INFO"]);
        assert!(store.fields().contains(&"message".to_string()));
    }
}
