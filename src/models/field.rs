use serde::{Deserialize, Serialize};

/// Which record field an extraction pattern runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceField {
    Message,
    Level,
    Source,
    Raw,
}

impl SourceField {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceField::Message => "message",
            SourceField::Level => "level",
            SourceField::Source => "source",
            SourceField::Raw => "raw",
        }
    }

    pub fn parse(s: &str) -> Option<SourceField> {
        match s {
            "message" => Some(SourceField::Message),
            "level" => Some(SourceField::Level),
            "source" => Some(SourceField::Source),
            "raw" => Some(SourceField::Raw),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldType {
    String,
    Number,
    Date,
    Boolean,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "STRING",
            FieldType::Number => "NUMBER",
            FieldType::Date => "DATE",
            FieldType::Boolean => "BOOLEAN",
        }
    }

    pub fn parse(s: &str) -> Option<FieldType> {
        match s {
            "STRING" => Some(FieldType::String),
            "NUMBER" => Some(FieldType::Number),
            "DATE" => Some(FieldType::Date),
            "BOOLEAN" => Some(FieldType::Boolean),
            _ => None,
        }
    }
}

/// A configured derived field. With no `extraction_pattern` the whole source
/// field becomes the value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldConfiguration {
    pub id: String,
    pub name: String,
    pub source_field: SourceField,
    #[serde(default)]
    pub extraction_pattern: Option<String>,
    pub field_type: FieldType,
    pub indexed: bool,
    pub stored: bool,
    pub tokenized: bool,
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFieldConfigurationRequest {
    pub name: String,
    #[serde(default = "default_source_field")]
    pub source_field: SourceField,
    #[serde(default)]
    pub extraction_pattern: Option<String>,
    #[serde(default = "default_field_type")]
    pub field_type: FieldType,
    #[serde(default = "default_true")]
    pub indexed: bool,
    #[serde(default = "default_true")]
    pub stored: bool,
    #[serde(default)]
    pub tokenized: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_source_field() -> SourceField {
    SourceField::Message
}

fn default_field_type() -> FieldType {
    FieldType::String
}

fn default_true() -> bool {
    true
}

/// Payload for `POST /fieldConfigurations/test`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldTestRequest {
    pub config: CreateFieldConfigurationRequest,
    pub sample: String,
}
