use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShardingType {
    TimeBased,
    SourceBased,
    Balanced,
}

/// How the logical index is partitioned into shards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardConfiguration {
    pub id: String,
    pub sharding_type: ShardingType,
    pub number_of_shards: usize,
    pub replication_enabled: bool,
    pub replication_factor: usize,
    pub sharding_enabled: bool,
}

impl Default for ShardConfiguration {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            sharding_type: ShardingType::TimeBased,
            number_of_shards: 1,
            replication_enabled: false,
            replication_factor: 1,
            sharding_enabled: false,
        }
    }
}

impl ShardConfiguration {
    /// Effective shard-group count: 1 unless sharding is enabled.
    pub fn group_count(&self) -> usize {
        if self.sharding_enabled {
            self.number_of_shards.max(1)
        } else {
            1
        }
    }

    /// Replicas per group: 1 unless replication is enabled.
    pub fn replica_count(&self) -> usize {
        if self.replication_enabled {
            self.replication_factor.max(1)
        } else {
            1
        }
    }
}
