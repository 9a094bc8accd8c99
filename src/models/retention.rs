use serde::{Deserialize, Serialize};

/// Age-based deletion policy. Empty `apply_to_sources` means every source.
/// When several enabled policies cover the same source, the smallest
/// `max_age_days` wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    pub id: String,
    pub name: String,
    pub max_age_days: u32,
    #[serde(default)]
    pub apply_to_sources: Vec<String>,
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRetentionPolicyRequest {
    pub name: String,
    pub max_age_days: u32,
    #[serde(default)]
    pub apply_to_sources: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}
