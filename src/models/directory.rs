use serde::{Deserialize, Serialize};

/// A watched log directory. `file_pattern` is a glob (`*`, `?`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogDirectoryConfig {
    pub id: String,
    pub directory_path: String,
    pub file_pattern: String,
    pub scan_interval_seconds: u64,
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDirectoryConfigRequest {
    pub directory_path: String,
    #[serde(default = "default_pattern")]
    pub file_pattern: String,
    #[serde(default = "default_scan_interval")]
    pub scan_interval_seconds: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_pattern() -> String {
    "*.log".to_string()
}

fn default_scan_interval() -> u64 {
    10
}

fn default_enabled() -> bool {
    true
}
