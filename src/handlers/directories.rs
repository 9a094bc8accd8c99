//! CRUD for log directory configs plus on-demand scans.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;

use crate::AppState;
use crate::models::directory::{CreateDirectoryConfigRequest, LogDirectoryConfig};
use crate::scanner::ScanError;

use super::ApiError;

pub async fn list(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let configs = state.config_db.list_directory_configs()?;
    Ok(Json(configs))
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let config = state
        .config_db
        .get_directory_config(&id)?
        .ok_or_else(|| ApiError::NotFound("directory config not found".to_string()))?;
    Ok(Json(config))
}

pub async fn create(
    State(state): State<AppState>,
    Json(req): Json<CreateDirectoryConfigRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.directory_path.trim().is_empty() {
        return Err(ApiError::BadRequest("directoryPath must not be empty".to_string()));
    }
    if req.scan_interval_seconds < 1 {
        return Err(ApiError::BadRequest(
            "scanIntervalSeconds must be >= 1".to_string(),
        ));
    }
    let config = LogDirectoryConfig {
        id: uuid::Uuid::new_v4().to_string(),
        directory_path: req.directory_path,
        file_pattern: req.file_pattern,
        scan_interval_seconds: req.scan_interval_seconds,
        enabled: req.enabled,
    };
    state.config_db.create_directory_config(&config)?;
    Ok((StatusCode::CREATED, Json(config)))
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<CreateDirectoryConfigRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.scan_interval_seconds < 1 {
        return Err(ApiError::BadRequest(
            "scanIntervalSeconds must be >= 1".to_string(),
        ));
    }
    let config = LogDirectoryConfig {
        id: id.clone(),
        directory_path: req.directory_path,
        file_pattern: req.file_pattern,
        scan_interval_seconds: req.scan_interval_seconds,
        enabled: req.enabled,
    };
    if !state.config_db.update_directory_config(&config)? {
        return Err(ApiError::NotFound("directory config not found".to_string()));
    }
    Ok(Json(config))
}

pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.config_db.delete_directory_config(&id)? {
        return Err(ApiError::NotFound("directory config not found".to_string()));
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn scan(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.scanner.scan_now(&id).await {
        Ok(processed) => Ok(Json(serde_json::json!({ "processed": processed }))),
        Err(ScanError::NotFound) => {
            Err(ApiError::NotFound("directory config not found".to_string()))
        }
        Err(ScanError::Disabled) => {
            Err(ApiError::BadRequest("directory config is disabled".to_string()))
        }
        Err(e) => Err(ApiError::Internal(e.to_string())),
    }
}

pub async fn scan_all(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let processed = state
        .scanner
        .scan_all_now()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(serde_json::json!({ "processed": processed })))
}
