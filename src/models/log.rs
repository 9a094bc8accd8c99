use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Severity of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
    Unknown,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
            LogLevel::Unknown => "UNKNOWN",
        }
    }

    /// Parse a level word as it appears in log lines. `WARN` and `WARNING`
    /// both map to `Warning`, `ERR` to `Error`.
    pub fn parse(s: &str) -> Option<LogLevel> {
        match s.to_ascii_uppercase().as_str() {
            "TRACE" => Some(LogLevel::Trace),
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARN" | "WARNING" => Some(LogLevel::Warning),
            "ERR" | "ERROR" => Some(LogLevel::Error),
            "FATAL" | "CRITICAL" => Some(LogLevel::Fatal),
            "UNKNOWN" => Some(LogLevel::Unknown),
            _ => None,
        }
    }

    pub fn all() -> [LogLevel; 7] {
        [
            LogLevel::Trace,
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Warning,
            LogLevel::Error,
            LogLevel::Fatal,
            LogLevel::Unknown,
        ]
    }
}

/// One parsed log entry. `message` is post-redaction; `raw` keeps the
/// original line when the storage policy allows it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: String,
    /// Epoch milliseconds, UTC.
    pub timestamp: i64,
    pub level: LogLevel,
    pub source: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl LogRecord {
    /// Flatten into a JSON object for query pipelines and exports. Extracted
    /// fields sit next to the built-ins; a field named like a built-in does
    /// not shadow it.
    pub fn to_row(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut row = serde_json::Map::new();
        row.insert("id".into(), self.id.clone().into());
        row.insert("timestamp".into(), self.timestamp.into());
        row.insert("level".into(), self.level.as_str().into());
        row.insert("source".into(), self.source.clone().into());
        row.insert("message".into(), self.message.clone().into());
        if let Some(host) = &self.host {
            row.insert("host".into(), host.clone().into());
        }
        for (k, v) in &self.fields {
            row.entry(k.clone())
                .or_insert_with(|| serde_json::Value::String(v.clone()));
        }
        row
    }

    /// Value of a named field: built-ins first, then extracted fields.
    pub fn field_value(&self, name: &str) -> Option<String> {
        match name {
            "id" => Some(self.id.clone()),
            "timestamp" => Some(self.timestamp.to_string()),
            "level" => Some(self.level.as_str().to_string()),
            "source" => Some(self.source.clone()),
            "message" => Some(self.message.clone()),
            "host" => self.host.clone(),
            "raw" => self.raw.clone(),
            _ => self.fields.get(name).cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_parse_aliases() {
        assert_eq!(LogLevel::parse("warn"), Some(LogLevel::Warning));
        assert_eq!(LogLevel::parse("WARNING"), Some(LogLevel::Warning));
        assert_eq!(LogLevel::parse("err"), Some(LogLevel::Error));
        assert_eq!(LogLevel::parse("nope"), None);
    }

    #[test]
    fn field_value_prefers_builtins() {
        let mut fields = BTreeMap::new();
        fields.insert("level".to_string(), "shadowed".to_string());
        fields.insert("ip".to_string(), "10.0.0.1".to_string());
        let rec = LogRecord {
            id: "r1".into(),
            timestamp: 1,
            level: LogLevel::Error,
            source: "app.log".into(),
            message: "boom".into(),
            raw: None,
            fields,
            host: None,
        };
        assert_eq!(rec.field_value("level").as_deref(), Some("ERROR"));
        assert_eq!(rec.field_value("ip").as_deref(), Some("10.0.0.1"));
        assert_eq!(rec.field_value("missing"), None);
    }
}
