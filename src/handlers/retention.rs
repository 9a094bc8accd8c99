//! CRUD for retention policies plus on-demand application.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;

use crate::AppState;
use crate::models::retention::{CreateRetentionPolicyRequest, RetentionPolicy};
use crate::retention::RetentionError;

use super::ApiError;

pub async fn list(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let policies = state.config_db.list_retention_policies()?;
    Ok(Json(policies))
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let policy = state
        .config_db
        .get_retention_policy(&id)?
        .ok_or_else(|| ApiError::NotFound("retention policy not found".to_string()))?;
    Ok(Json(policy))
}

pub async fn create(
    State(state): State<AppState>,
    Json(req): Json<CreateRetentionPolicyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.max_age_days < 1 {
        return Err(ApiError::BadRequest("maxAgeDays must be >= 1".to_string()));
    }
    let policy = RetentionPolicy {
        id: uuid::Uuid::new_v4().to_string(),
        name: req.name,
        max_age_days: req.max_age_days,
        apply_to_sources: req.apply_to_sources,
        enabled: req.enabled,
    };
    state.config_db.create_retention_policy(&policy)?;
    Ok((StatusCode::CREATED, Json(policy)))
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<CreateRetentionPolicyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.max_age_days < 1 {
        return Err(ApiError::BadRequest("maxAgeDays must be >= 1".to_string()));
    }
    let policy = RetentionPolicy {
        id: id.clone(),
        name: req.name,
        max_age_days: req.max_age_days,
        apply_to_sources: req.apply_to_sources,
        enabled: req.enabled,
    };
    if !state.config_db.update_retention_policy(&policy)? {
        return Err(ApiError::NotFound("retention policy not found".to_string()));
    }
    Ok(Json(policy))
}

pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.config_db.delete_retention_policy(&id)? {
        return Err(ApiError::NotFound("retention policy not found".to_string()));
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn apply(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.retention.apply(&id).await {
        Ok(deleted) => Ok(Json(serde_json::json!({ "deleted": deleted }))),
        Err(RetentionError::NotFound) => {
            Err(ApiError::NotFound("retention policy not found".to_string()))
        }
        Err(e) => Err(ApiError::Internal(e.to_string())),
    }
}

pub async fn apply_all(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let deleted = state
        .retention
        .apply_all()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}
