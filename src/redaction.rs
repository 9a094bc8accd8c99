//! Redaction engine: replaces sensitive substrings with a fixed mask before
//! anything reaches the index.
//!
//! The stored form is a grouped map `group key -> { patterns: [regex, ...] }`
//! where the key is either a single field name or a JSON-encoded array of
//! field names. Groups with an invalid regex are skipped with a warning and
//! never fail the pipeline. The compiled form is swapped atomically; batches
//! already in flight keep the snapshot they entered the pipeline with.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

pub const MASK: &str = "<REDACTED>";

/// Wire/storage form of one redaction group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedactionGroup {
    #[serde(default)]
    pub patterns: Vec<String>,
}

/// The full grouped config as stored and served over the API.
pub type RedactionConfigMap = BTreeMap<String, RedactionGroup>;

/// Compiled rules, immutable once built.
#[derive(Debug, Default)]
pub struct CompiledRedaction {
    /// field name -> compiled patterns from every group targeting it
    rules: HashMap<String, Vec<Regex>>,
}

impl CompiledRedaction {
    pub fn compile(config: &RedactionConfigMap) -> Self {
        let mut rules: HashMap<String, Vec<Regex>> = HashMap::new();
        for (key, group) in config {
            let mut compiled = Vec::with_capacity(group.patterns.len());
            let mut valid = true;
            for pattern in &group.patterns {
                match Regex::new(pattern) {
                    Ok(re) => compiled.push(re),
                    Err(e) => {
                        tracing::warn!("redaction group '{key}': invalid pattern '{pattern}': {e}");
                        valid = false;
                        break;
                    }
                }
            }
            if !valid {
                continue;
            }
            for field in target_fields(key) {
                rules.entry(field).or_default().extend(compiled.iter().cloned());
            }
        }
        Self { rules }
    }

    /// Replace every match of every rule targeting `field` with the mask.
    /// Idempotent: the mask itself contains nothing the rules should match
    /// twice, and re-running yields the same string.
    pub fn redact<'a>(&self, field: &str, value: &'a str) -> Cow<'a, str> {
        let Some(rules) = self.rules.get(field) else {
            return Cow::Borrowed(value);
        };
        let mut current = Cow::Borrowed(value);
        for re in rules {
            match re.replace_all(&current, MASK) {
                Cow::Borrowed(_) => {}
                Cow::Owned(replaced) => current = Cow::Owned(replaced),
            }
        }
        current
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// A group key addresses one field (`"message"`) or several
/// (`"[\"message\",\"raw\"]"`).
fn target_fields(key: &str) -> Vec<String> {
    if key.trim_start().starts_with('[') {
        if let Ok(names) = serde_json::from_str::<Vec<String>>(key) {
            return names;
        }
    }
    vec![key.to_string()]
}

/// Hands out copy-on-write snapshots of the compiled config.
pub struct RedactionEngine {
    current: RwLock<Arc<CompiledRedaction>>,
}

impl RedactionEngine {
    pub fn new(config: &RedactionConfigMap) -> Self {
        Self {
            current: RwLock::new(Arc::new(CompiledRedaction::compile(config))),
        }
    }

    /// Snapshot for one batch. Later reloads do not affect it.
    pub fn snapshot(&self) -> Arc<CompiledRedaction> {
        self.current.read().unwrap().clone()
    }

    /// Recompile and swap atomically.
    pub fn reload(&self, config: &RedactionConfigMap) {
        let compiled = Arc::new(CompiledRedaction::compile(config));
        *self.current.write().unwrap() = compiled;
        tracing::info!("redaction config reloaded ({} group(s))", config.len());
    }
}
