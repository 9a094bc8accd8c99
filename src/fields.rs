//! Field extraction: derives structured fields from raw records using the
//! configured patterns, and doubles as the per-field catalog the index and
//! query layers consult for `indexed` / `stored` / `tokenized` flags and
//! value types.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;

use crate::models::field::{FieldConfiguration, FieldType, SourceField};
use crate::models::log::LogRecord;

/// Indexing flags for one field, as the index store sees them.
#[derive(Debug, Clone, Copy)]
pub struct FieldOptions {
    pub indexed: bool,
    pub stored: bool,
    pub tokenized: bool,
    pub field_type: FieldType,
}

impl Default for FieldOptions {
    fn default() -> Self {
        Self {
            indexed: true,
            stored: true,
            tokenized: false,
            field_type: FieldType::String,
        }
    }
}

#[derive(Debug)]
struct CompiledField {
    config: FieldConfiguration,
    pattern: Option<Regex>,
}

/// Immutable compiled snapshot of all enabled field configurations.
#[derive(Debug, Default)]
pub struct FieldCatalog {
    fields: Vec<CompiledField>,
}

impl FieldCatalog {
    pub fn compile(configs: &[FieldConfiguration]) -> Self {
        let mut fields = Vec::new();
        for config in configs {
            if !config.enabled {
                continue;
            }
            let pattern = match &config.extraction_pattern {
                Some(p) => match Regex::new(p) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        tracing::warn!(
                            "field '{}': invalid extraction pattern '{p}': {e}",
                            config.name
                        );
                        continue;
                    }
                },
                None => None,
            };
            fields.push(CompiledField {
                config: config.clone(),
                pattern,
            });
        }
        Self { fields }
    }

    /// Run every enabled configuration against `record`. A value that fails
    /// type coercion is dropped with a warning; the record still indexes.
    pub fn extract(&self, record: &LogRecord) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for field in &self.fields {
            let source = match field.config.source_field {
                SourceField::Message => Some(record.message.as_str()),
                SourceField::Level => Some(record.level.as_str()),
                SourceField::Source => Some(record.source.as_str()),
                SourceField::Raw => record.raw.as_deref(),
            };
            let Some(source) = source else { continue };
            let Some(value) = extract_value(field.pattern.as_ref(), source) else {
                continue;
            };
            match coerce(&value, field.config.field_type) {
                Some(coerced) => {
                    out.insert(field.config.name.clone(), coerced);
                }
                None => {
                    tracing::warn!(
                        "field '{}': value '{value}' is not a valid {}, dropping",
                        field.config.name,
                        field.config.field_type.as_str()
                    );
                }
            }
        }
        out
    }

    /// Flags for a named field. Unknown fields get the defaults (stored,
    /// indexed, untokenized string) so ad-hoc fields stay searchable.
    pub fn options(&self, name: &str) -> FieldOptions {
        for field in &self.fields {
            if field.config.name == name {
                return FieldOptions {
                    indexed: field.config.indexed,
                    stored: field.config.stored,
                    tokenized: field.config.tokenized,
                    field_type: field.config.field_type,
                };
            }
        }
        FieldOptions::default()
    }

    /// Names of configured fields with `tokenized = true`; unqualified query
    /// terms match against these in addition to `message`.
    pub fn tokenized_fields(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|f| f.config.tokenized && f.config.indexed)
            .map(|f| f.config.name.as_str())
            .collect()
    }
}

fn extract_value(pattern: Option<&Regex>, source: &str) -> Option<String> {
    match pattern {
        None => Some(source.to_string()),
        Some(re) => {
            let caps = re.captures(source)?;
            let m = caps.get(1).or_else(|| caps.get(0))?;
            Some(m.as_str().to_string())
        }
    }
}

/// Validate and canonicalize a value for its configured type. Returns the
/// original string on success (the index stores strings; typed comparison
/// happens at query time).
pub fn coerce(value: &str, field_type: FieldType) -> Option<String> {
    let trimmed = value.trim();
    match field_type {
        FieldType::String => Some(value.to_string()),
        FieldType::Number => trimmed.parse::<f64>().ok().map(|_| trimmed.to_string()),
        FieldType::Date => parse_date_ms(trimmed).map(|_| trimmed.to_string()),
        FieldType::Boolean => match trimmed.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some("true".to_string()),
            "false" | "0" | "no" => Some("false".to_string()),
            _ => None,
        },
    }
}

/// Parse a DATE value: ISO-8601 or `yyyy-MM-dd HH:mm:ss`, both UTC.
pub fn parse_date_ms(s: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc).timestamp_millis());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc().timestamp_millis());
        }
    }
    None
}

/// Copy-on-write registry; readers take a snapshot per batch.
pub struct FieldRegistry {
    current: RwLock<Arc<FieldCatalog>>,
}

impl FieldRegistry {
    pub fn new(configs: &[FieldConfiguration]) -> Self {
        Self {
            current: RwLock::new(Arc::new(FieldCatalog::compile(configs))),
        }
    }

    pub fn snapshot(&self) -> Arc<FieldCatalog> {
        self.current.read().unwrap().clone()
    }

    pub fn reload(&self, configs: &[FieldConfiguration]) {
        *self.current.write().unwrap() = Arc::new(FieldCatalog::compile(configs));
        tracing::info!("field configurations reloaded ({} total)", configs.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::log::LogLevel;

    fn record(message: &str) -> LogRecord {
        LogRecord {
            id: "r1".into(),
            timestamp: 0,
            level: LogLevel::Info,
            source: "app.log".into(),
            message: message.into(),
            raw: None,
            fields: BTreeMap::new(),
            host: None,
        }
    }

    fn field_config(name: &str, pattern: Option<&str>, field_type: FieldType) -> FieldConfiguration {
        FieldConfiguration {
            id: name.into(),
            name: name.into(),
            source_field: SourceField::Message,
            extraction_pattern: pattern.map(|p| p.to_string()),
            field_type,
            indexed: true,
            stored: true,
            tokenized: false,
            enabled: true,
        }
    }

    #[test]
    fn extracts_first_capture_group() {
        let catalog = FieldCatalog::compile(&[field_config(
            "status",
            Some(r"status=(\d+)"),
            FieldType::Number,
        )]);
        let fields = catalog.extract(&record("GET / status=404 in 3ms"));
        assert_eq!(fields.get("status").map(String::as_str), Some("404"));
    }

    #[test]
    fn full_match_when_no_group() {
        let catalog = FieldCatalog::compile(&[field_config(
            "ip",
            Some(r"\b(?:\d{1,3}\.){3}\d{1,3}\b"),
            FieldType::String,
        )]);
        let fields = catalog.extract(&record("request from 10.0.0.1 ok"));
        assert_eq!(fields.get("ip").map(String::as_str), Some("10.0.0.1"));
    }

    #[test]
    fn whole_source_when_no_pattern() {
        let catalog = FieldCatalog::compile(&[field_config("msg_copy", None, FieldType::String)]);
        let fields = catalog.extract(&record("hello"));
        assert_eq!(fields.get("msg_copy").map(String::as_str), Some("hello"));
    }

    #[test]
    fn coercion_failure_drops_field() {
        let catalog = FieldCatalog::compile(&[field_config(
            "status",
            Some(r"status=(\S+)"),
            FieldType::Number,
        )]);
        let fields = catalog.extract(&record("status=oops"));
        assert!(fields.is_empty());
    }

    #[test]
    fn number_accepts_scientific() {
        assert!(coerce("1.5e3", FieldType::Number).is_some());
        assert!(coerce("-12.25", FieldType::Number).is_some());
        assert!(coerce("abc", FieldType::Number).is_none());
    }

    #[test]
    fn boolean_forms() {
        assert_eq!(coerce("YES", FieldType::Boolean).as_deref(), Some("true"));
        assert_eq!(coerce("0", FieldType::Boolean).as_deref(), Some("false"));
        assert!(coerce("maybe", FieldType::Boolean).is_none());
    }

    #[test]
    fn date_formats() {
        assert_eq!(parse_date_ms("2025-01-01T00:00:01Z"), Some(1_735_689_601_000));
        assert_eq!(parse_date_ms("2025-01-01 00:00:01"), Some(1_735_689_601_000));
        assert!(parse_date_ms("January 1st").is_none());
    }

    #[test]
    fn disabled_and_invalid_configs_skipped() {
        let mut disabled = field_config("a", None, FieldType::String);
        disabled.enabled = false;
        let invalid = field_config("b", Some("(unclosed"), FieldType::String);
        let catalog = FieldCatalog::compile(&[disabled, invalid]);
        assert!(catalog.extract(&record("x")).is_empty());
    }
}
