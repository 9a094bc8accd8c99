//! CRUD for field configurations. Changes recompile the shared catalog so
//! the next ingest batch picks them up; a `/test` endpoint runs a candidate
//! config against a sample line without saving it.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use std::collections::BTreeMap;

use crate::AppState;
use crate::fields::FieldCatalog;
use crate::models::field::{CreateFieldConfigurationRequest, FieldConfiguration, FieldTestRequest};
use crate::models::log::{LogLevel, LogRecord};

use super::ApiError;

fn validate_pattern(pattern: Option<&str>) -> Result<(), ApiError> {
    if let Some(pattern) = pattern {
        regex::Regex::new(pattern)
            .map_err(|e| ApiError::BadRequest(format!("invalid extractionPattern: {e}")))?;
    }
    Ok(())
}

fn reload_catalog(state: &AppState) -> Result<(), ApiError> {
    let configs = state.config_db.list_field_configurations()?;
    state.fields.reload(&configs);
    Ok(())
}

fn from_request(id: String, req: CreateFieldConfigurationRequest) -> FieldConfiguration {
    FieldConfiguration {
        id,
        name: req.name,
        source_field: req.source_field,
        extraction_pattern: req.extraction_pattern,
        field_type: req.field_type,
        indexed: req.indexed,
        stored: req.stored,
        tokenized: req.tokenized,
        enabled: req.enabled,
    }
}

pub async fn list(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let configs = state.config_db.list_field_configurations()?;
    Ok(Json(configs))
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let config = state
        .config_db
        .get_field_configuration(&id)?
        .ok_or_else(|| ApiError::NotFound("field configuration not found".to_string()))?;
    Ok(Json(config))
}

pub async fn create(
    State(state): State<AppState>,
    Json(req): Json<CreateFieldConfigurationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name must not be empty".to_string()));
    }
    validate_pattern(req.extraction_pattern.as_deref())?;
    let config = from_request(uuid::Uuid::new_v4().to_string(), req);
    state.config_db.create_field_configuration(&config)?;
    reload_catalog(&state)?;
    Ok((StatusCode::CREATED, Json(config)))
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<CreateFieldConfigurationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_pattern(req.extraction_pattern.as_deref())?;
    let config = from_request(id, req);
    if !state.config_db.update_field_configuration(&config)? {
        return Err(ApiError::NotFound("field configuration not found".to_string()));
    }
    reload_catalog(&state)?;
    Ok(Json(config))
}

pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.config_db.delete_field_configuration(&id)? {
        return Err(ApiError::NotFound("field configuration not found".to_string()));
    }
    reload_catalog(&state)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Run a candidate configuration against a sample line.
pub async fn test(
    State(_state): State<AppState>,
    Json(req): Json<FieldTestRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_pattern(req.config.extraction_pattern.as_deref())?;
    let mut config = from_request("test".to_string(), req.config);
    config.enabled = true;
    let name = config.name.clone();
    let catalog = FieldCatalog::compile(&[config]);

    let record = LogRecord {
        id: "test".to_string(),
        timestamp: chrono::Utc::now().timestamp_millis(),
        level: LogLevel::Unknown,
        source: "test".to_string(),
        message: req.sample.clone(),
        raw: Some(req.sample),
        fields: BTreeMap::new(),
        host: None,
    };
    let extracted = catalog.extract(&record);
    Ok(Json(serde_json::json!({ "value": extracted.get(&name) })))
}
