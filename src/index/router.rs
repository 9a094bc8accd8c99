//! Shard routing: maps record writes to a shard group and prunes query
//! fan-out when the strategy allows it.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::models::log::LogRecord;
use crate::models::shard::{ShardConfiguration, ShardingType};

/// Width of one time bucket for TIME_BASED routing.
const TIME_BUCKET_MS: i64 = 24 * 60 * 60 * 1000;

pub struct ShardRouter {
    sharding_type: ShardingType,
    groups: usize,
    round_robin: AtomicUsize,
}

impl ShardRouter {
    pub fn new(config: &ShardConfiguration) -> Self {
        Self {
            sharding_type: config.sharding_type,
            groups: config.group_count(),
            round_robin: AtomicUsize::new(0),
        }
    }

    pub fn group_count(&self) -> usize {
        self.groups
    }

    /// Shard group for one record at ingest.
    pub fn route(&self, record: &LogRecord) -> usize {
        if self.groups == 1 {
            return 0;
        }
        match self.sharding_type {
            ShardingType::TimeBased => {
                let bucket = record.timestamp.div_euclid(TIME_BUCKET_MS);
                bucket.rem_euclid(self.groups as i64) as usize
            }
            ShardingType::SourceBased => fnv1a(record.source.as_bytes()) as usize % self.groups,
            ShardingType::Balanced => self.round_robin.fetch_add(1, Ordering::Relaxed) % self.groups,
        }
    }

    /// Shard groups a query must visit. `source` is the exact-source filter
    /// extracted from the plan, if the query pins one.
    pub fn groups_for_query(&self, range: Option<(i64, i64)>, source: Option<&str>) -> Vec<usize> {
        if self.groups == 1 {
            return vec![0];
        }
        match self.sharding_type {
            ShardingType::TimeBased => match range {
                Some((from, to)) if from <= to => {
                    let first = from.div_euclid(TIME_BUCKET_MS);
                    let last = to.div_euclid(TIME_BUCKET_MS);
                    if last - first + 1 >= self.groups as i64 {
                        (0..self.groups).collect()
                    } else {
                        let mut out: Vec<usize> = (first..=last)
                            .map(|b| b.rem_euclid(self.groups as i64) as usize)
                            .collect();
                        out.sort_unstable();
                        out.dedup();
                        out
                    }
                }
                _ => (0..self.groups).collect(),
            },
            ShardingType::SourceBased => match source {
                Some(s) => vec![fnv1a(s.as_bytes()) as usize % self.groups],
                None => (0..self.groups).collect(),
            },
            ShardingType::Balanced => (0..self.groups).collect(),
        }
    }
}

/// FNV-1a, stable across runs (unlike `DefaultHasher`).
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::log::LogLevel;
    use std::collections::BTreeMap;

    fn config(sharding_type: ShardingType, shards: usize) -> ShardConfiguration {
        ShardConfiguration {
            sharding_type,
            number_of_shards: shards,
            sharding_enabled: true,
            ..ShardConfiguration::default()
        }
    }

    fn record(ts: i64, source: &str) -> LogRecord {
        LogRecord {
            id: "r".into(),
            timestamp: ts,
            level: LogLevel::Info,
            source: source.into(),
            message: String::new(),
            raw: None,
            fields: BTreeMap::new(),
            host: None,
        }
    }

    #[test]
    fn source_routing_is_stable() {
        let router = ShardRouter::new(&config(ShardingType::SourceBased, 4));
        let a = router.route(&record(0, "app.log"));
        let b = router.route(&record(99, "app.log"));
        assert_eq!(a, b);
        assert_eq!(router.groups_for_query(None, Some("app.log")), vec![a]);
        assert_eq!(router.groups_for_query(None, None).len(), 4);
    }

    #[test]
    fn time_routing_prunes_fanout() {
        let router = ShardRouter::new(&config(ShardingType::TimeBased, 4));
        // A range within one day maps to a single group.
        let from = 3 * TIME_BUCKET_MS + 1000;
        let to = 3 * TIME_BUCKET_MS + 2000;
        let groups = router.groups_for_query(Some((from, to)), None);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0], router.route(&record(from, "x")));
        // A range wider than the ring fans out everywhere.
        let wide = router.groups_for_query(Some((0, 10 * TIME_BUCKET_MS)), None);
        assert_eq!(wide.len(), 4);
    }

    #[test]
    fn balanced_round_robins() {
        let router = ShardRouter::new(&config(ShardingType::Balanced, 3));
        let hits: Vec<usize> = (0..6).map(|_| router.route(&record(0, "s"))).collect();
        assert_eq!(hits, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn single_group_short_circuits() {
        let router = ShardRouter::new(&ShardConfiguration::default());
        assert_eq!(router.route(&record(123, "x")), 0);
        assert_eq!(router.groups_for_query(None, None), vec![0]);
    }
}
