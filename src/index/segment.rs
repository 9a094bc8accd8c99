//! Immutable on-disk index segments.
//!
//! A segment holds an inverted index `(field, token) -> posting list` plus a
//! row store of the records themselves, ordered timestamp-descending. Files
//! are MessagePack inside gzip, written to a temp name, fsynced, then
//! renamed into place.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};

use crate::fields::FieldCatalog;
use crate::models::log::LogRecord;

use super::IndexError;

pub type RecordId = String;

/// One entry of a posting list. Positions are token offsets within the
/// field value (only populated for tokenized fields).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Posting {
    pub record_id: RecordId,
    pub timestamp: i64,
    #[serde(default)]
    pub positions: Vec<u32>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Segment {
    pub id: u64,
    pub min_ts: i64,
    pub max_ts: i64,
    /// field -> token -> postings sorted (timestamp desc, record_id desc)
    pub postings: BTreeMap<String, BTreeMap<String, Vec<Posting>>>,
    /// Rows sorted (timestamp desc, record_id desc).
    pub rows: Vec<LogRecord>,
    pub sources: BTreeSet<String>,
    pub levels: BTreeSet<String>,
    pub field_names: BTreeSet<String>,
}

/// Sort key shared by rows and posting lists: newest first, ties broken by
/// record id, lexicographic descending.
pub fn record_order(a_ts: i64, a_id: &str, b_ts: i64, b_id: &str) -> std::cmp::Ordering {
    b_ts.cmp(&a_ts).then_with(|| b_id.cmp(a_id))
}

/// Lowercased alphanumeric runs with their token positions.
pub fn tokenize(value: &str) -> Vec<(String, u32)> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut position = 0u32;
    for ch in value.chars() {
        if ch.is_alphanumeric() || ch == '_' {
            current.extend(ch.to_lowercase());
        } else if !current.is_empty() {
            tokens.push((std::mem::take(&mut current), position));
            position += 1;
        }
    }
    if !current.is_empty() {
        tokens.push((current, position));
    }
    tokens
}

impl Segment {
    pub fn postings_for(&self, field: &str, token: &str) -> Option<&[Posting]> {
        self.postings.get(field)?.get(token).map(Vec::as_slice)
    }

    pub fn contains_token(&self, field: &str, token: &str) -> bool {
        self.postings_for(field, token).is_some()
    }

    pub fn overlaps(&self, from: i64, to: i64) -> bool {
        self.min_ts <= to && self.max_ts >= from
    }

    /// Persist to `path` via temp-write + fsync + rename, fsyncing the
    /// parent directory so the rename itself is durable.
    pub fn write_to(&self, path: &Path) -> Result<(), IndexError> {
        let tmp = path.with_extension("tmp");
        {
            let file = File::create(&tmp)?;
            let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
            rmp_serde::encode::write(&mut encoder, self)
                .map_err(|e| IndexError::Encode(e.to_string()))?;
            let writer = encoder.finish()?;
            writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        if let Some(dir) = path.parent() {
            File::open(dir)?.sync_all()?;
        }
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Segment, IndexError> {
        let file = File::open(path)?;
        let decoder = GzDecoder::new(BufReader::new(file));
        rmp_serde::from_read(decoder).map_err(|e| IndexError::Corrupt {
            segment: path.display().to_string(),
            reason: e.to_string(),
        })
    }
}

/// Accumulates one batch into a segment. Records are assumed to be already
/// redacted and field-extracted.
pub struct SegmentBuilder {
    id: u64,
    store_raw: bool,
    records: Vec<LogRecord>,
}

impl SegmentBuilder {
    pub fn new(id: u64, store_raw: bool) -> Self {
        Self {
            id,
            store_raw,
            records: Vec::new(),
        }
    }

    pub fn push(&mut self, record: LogRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn build(self, catalog: &FieldCatalog) -> Segment {
        let mut segment = Segment {
            id: self.id,
            min_ts: i64::MAX,
            max_ts: i64::MIN,
            ..Segment::default()
        };

        let mut rows = Vec::with_capacity(self.records.len());
        for mut record in self.records {
            segment.min_ts = segment.min_ts.min(record.timestamp);
            segment.max_ts = segment.max_ts.max(record.timestamp);
            segment.sources.insert(record.source.clone());
            segment.levels.insert(record.level.as_str().to_string());

            index_tokenized(&mut segment, "message", &record.message, &record);
            index_exact(&mut segment, "level", record.level.as_str(), &record);
            index_exact(&mut segment, "source", &record.source, &record);
            if let Some(host) = record.host.clone() {
                index_exact(&mut segment, "host", &host, &record);
            }

            for (name, value) in record.fields.clone() {
                segment.field_names.insert(name.clone());
                let options = catalog.options(&name);
                if options.indexed {
                    if options.tokenized {
                        index_tokenized(&mut segment, &name, &value, &record);
                    } else {
                        index_exact(&mut segment, &name, &value, &record);
                    }
                }
            }

            // Strip what the storage policy says not to keep; the postings
            // above were built from the full record.
            if !self.store_raw {
                record.raw = None;
            }
            record.fields.retain(|name, _| catalog.options(name).stored);
            rows.push(record);
        }

        rows.sort_by(|a, b| record_order(a.timestamp, &a.id, b.timestamp, &b.id));
        segment.rows = rows;
        if segment.min_ts == i64::MAX {
            segment.min_ts = 0;
            segment.max_ts = 0;
        }
        for tokens in segment.postings.values_mut() {
            for postings in tokens.values_mut() {
                postings.sort_by(|a, b| {
                    record_order(a.timestamp, &a.record_id, b.timestamp, &b.record_id)
                });
            }
        }
        segment
    }
}

fn index_tokenized(segment: &mut Segment, field: &str, value: &str, record: &LogRecord) {
    let mut per_token: BTreeMap<String, Vec<u32>> = BTreeMap::new();
    for (token, position) in tokenize(value) {
        per_token.entry(token).or_default().push(position);
    }
    let by_token = segment.postings.entry(field.to_string()).or_default();
    for (token, positions) in per_token {
        by_token.entry(token).or_default().push(Posting {
            record_id: record.id.clone(),
            timestamp: record.timestamp,
            positions,
        });
    }
}

fn index_exact(segment: &mut Segment, field: &str, value: &str, record: &LogRecord) {
    segment
        .postings
        .entry(field.to_string())
        .or_default()
        .entry(value.to_lowercase())
        .or_default()
        .push(Posting {
            record_id: record.id.clone(),
            timestamp: record.timestamp,
            positions: Vec::new(),
        });
}

/// Merge segments into one, dropping tombstoned records. Used by the
/// background merge; `id` is the id of the merged output.
pub fn merge(
    id: u64,
    segments: &[std::sync::Arc<Segment>],
    tombstones: &std::collections::HashSet<RecordId>,
) -> Segment {
    let mut merged = Segment {
        id,
        min_ts: i64::MAX,
        max_ts: i64::MIN,
        ..Segment::default()
    };

    for segment in segments {
        for row in &segment.rows {
            if tombstones.contains(&row.id) {
                continue;
            }
            merged.min_ts = merged.min_ts.min(row.timestamp);
            merged.max_ts = merged.max_ts.max(row.timestamp);
            merged.rows.push(row.clone());
        }
        for (field, tokens) in &segment.postings {
            let by_token = merged.postings.entry(field.clone()).or_default();
            for (token, postings) in tokens {
                let out = by_token.entry(token.clone()).or_default();
                out.extend(
                    postings
                        .iter()
                        .filter(|p| !tombstones.contains(&p.record_id))
                        .cloned(),
                );
            }
        }
    }

    // Rebuild catalogs from surviving rows and drop emptied posting lists.
    for row in &merged.rows {
        merged.sources.insert(row.source.clone());
        merged.levels.insert(row.level.as_str().to_string());
        for name in row.fields.keys() {
            merged.field_names.insert(name.clone());
        }
    }
    for tokens in merged.postings.values_mut() {
        tokens.retain(|_, postings| !postings.is_empty());
        for postings in tokens.values_mut() {
            postings
                .sort_by(|a, b| record_order(a.timestamp, &a.record_id, b.timestamp, &b.record_id));
        }
    }
    merged.postings.retain(|_, tokens| !tokens.is_empty());
    merged
        .rows
        .sort_by(|a, b| record_order(a.timestamp, &a.id, b.timestamp, &b.id));
    if merged.min_ts == i64::MAX {
        merged.min_ts = 0;
        merged.max_ts = 0;
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::log::LogLevel;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn record(id: &str, ts: i64, message: &str) -> LogRecord {
        LogRecord {
            id: id.into(),
            timestamp: ts,
            level: LogLevel::Info,
            source: "app.log".into(),
            message: message.into(),
            raw: Some(message.into()),
            fields: BTreeMap::new(),
            host: None,
        }
    }

    #[test]
    fn tokenize_splits_on_punctuation() {
        let tokens: Vec<String> = tokenize("GET /api/v1?q=Hello-World")
            .into_iter()
            .map(|(t, _)| t)
            .collect();
        assert_eq!(tokens, vec!["get", "api", "v1", "q", "hello", "world"]);
    }

    #[test]
    fn builder_orders_rows_newest_first() {
        let catalog = FieldCatalog::default();
        let mut builder = SegmentBuilder::new(1, true);
        builder.push(record("a", 100, "first"));
        builder.push(record("b", 300, "second"));
        builder.push(record("c", 200, "third"));
        let segment = builder.build(&catalog);
        let ids: Vec<&str> = segment.rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
        assert_eq!(segment.min_ts, 100);
        assert_eq!(segment.max_ts, 300);
    }

    #[test]
    fn message_tokens_are_searchable() {
        let catalog = FieldCatalog::default();
        let mut builder = SegmentBuilder::new(1, true);
        builder.push(record("a", 1, "hello WORLD"));
        let segment = builder.build(&catalog);
        assert!(segment.contains_token("message", "hello"));
        assert!(segment.contains_token("message", "world"));
        assert!(!segment.contains_token("message", "absent"));
        let postings = segment.postings_for("message", "hello").unwrap();
        assert_eq!(postings[0].positions, vec![0]);
    }

    #[test]
    fn store_raw_false_drops_raw() {
        let catalog = FieldCatalog::default();
        let mut builder = SegmentBuilder::new(1, false);
        builder.push(record("a", 1, "hello"));
        let segment = builder.build(&catalog);
        assert!(segment.rows[0].raw.is_none());
    }

    #[test]
    fn write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = FieldCatalog::default();
        let mut builder = SegmentBuilder::new(7, true);
        builder.push(record("a", 42, "persisted line"));
        let segment = builder.build(&catalog);

        let path = dir.path().join("seg-7.bin");
        segment.write_to(&path).unwrap();
        let loaded = Segment::read_from(&path).unwrap();
        assert_eq!(loaded.id, 7);
        assert_eq!(loaded.rows.len(), 1);
        assert!(loaded.contains_token("message", "persisted"));
    }

    #[test]
    fn corrupt_file_reports_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg-1.bin");
        std::fs::write(&path, b"not a segment").unwrap();
        match Segment::read_from(&path) {
            Err(IndexError::Corrupt { .. }) => {}
            other => panic!("expected corrupt error, got {other:?}"),
        }
    }

    #[test]
    fn merge_drops_tombstones() {
        let catalog = FieldCatalog::default();
        let mut b1 = SegmentBuilder::new(1, true);
        b1.push(record("a", 1, "keep me"));
        b1.push(record("b", 2, "drop me"));
        let s1 = Arc::new(b1.build(&catalog));

        let tombstones: HashSet<RecordId> = ["b".to_string()].into_iter().collect();
        let merged = merge(2, &[s1], &tombstones);
        assert_eq!(merged.rows.len(), 1);
        assert_eq!(merged.rows[0].id, "a");
        assert!(merged.contains_token("message", "keep"));
        // The posting list for the dropped record's unique token is gone.
        assert!(!merged.contains_token("message", "drop"));
    }
}
