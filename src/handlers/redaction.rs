//! Redaction config endpoints: read, replace, reload.

use axum::Json;
use axum::extract::State;
use axum::response::IntoResponse;

use crate::AppState;
use crate::redaction::RedactionConfigMap;

use super::ApiError;

pub async fn get_config(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let config = state.config_db.get_redaction_config()?;
    Ok(Json(config))
}

/// Replace the grouped config and swap the compiled rules atomically.
/// Invalid patterns inside a group make that group inert (with a warning)
/// but never fail the request.
pub async fn put_config(
    State(state): State<AppState>,
    Json(config): Json<RedactionConfigMap>,
) -> Result<impl IntoResponse, ApiError> {
    state.config_db.set_redaction_config(&config)?;
    state.redaction.reload(&config);
    Ok(Json(config))
}

/// Recompile from the stored config.
pub async fn reload(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let config = state.config_db.get_redaction_config()?;
    state.redaction.reload(&config);
    Ok(Json(serde_json::json!({ "groups": config.len() })))
}
