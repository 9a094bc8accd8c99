//! Alarm CRUD, event listing, acknowledge/resolve actions and statistics.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;

use crate::AppState;
use crate::models::alarm::{AckRequest, Alarm, CreateAlarmRequest};

use super::ApiError;

fn from_request(id: String, req: CreateAlarmRequest) -> Result<Alarm, ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name must not be empty".to_string()));
    }
    if req.time_window_minutes < 1 {
        return Err(ApiError::BadRequest(
            "timeWindowMinutes must be >= 1".to_string(),
        ));
    }
    if req.is_regex {
        regex::Regex::new(&req.query)
            .map_err(|e| ApiError::BadRequest(format!("invalid regex query: {e}")))?;
    } else {
        crate::query::parse(&req.query)?;
    }
    Ok(Alarm {
        id,
        name: req.name,
        query: req.query,
        is_regex: req.is_regex,
        condition: req.condition,
        threshold: req.threshold,
        time_window_minutes: req.time_window_minutes,
        enabled: req.enabled,
        notification_channels: req.notification_channels,
        throttle_window_minutes: req.throttle_window_minutes,
    })
}

pub async fn list(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let alarms = state.config_db.list_alarms()?;
    Ok(Json(alarms))
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let alarm = state
        .config_db
        .get_alarm(&id)?
        .ok_or_else(|| ApiError::NotFound("alarm not found".to_string()))?;
    Ok(Json(alarm))
}

pub async fn create(
    State(state): State<AppState>,
    Json(req): Json<CreateAlarmRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let alarm = from_request(uuid::Uuid::new_v4().to_string(), req)?;
    state.config_db.create_alarm(&alarm)?;
    Ok((StatusCode::CREATED, Json(alarm)))
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<CreateAlarmRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let alarm = from_request(id, req)?;
    if !state.config_db.update_alarm(&alarm)? {
        return Err(ApiError::NotFound("alarm not found".to_string()));
    }
    Ok(Json(alarm))
}

pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.config_db.delete_alarm(&id)? {
        return Err(ApiError::NotFound("alarm not found".to_string()));
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn toggle(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let alarm = state
        .config_db
        .get_alarm(&id)?
        .ok_or_else(|| ApiError::NotFound("alarm not found".to_string()))?;
    state.config_db.set_alarm_enabled(&id, !alarm.enabled)?;
    let alarm = state
        .config_db
        .get_alarm(&id)?
        .ok_or_else(|| ApiError::Internal("failed to re-read alarm".to_string()))?;
    Ok(Json(alarm))
}

pub async fn list_events(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let events = state.config_db.list_alarm_events(200)?;
    Ok(Json(events))
}

pub async fn acknowledge(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Option<Json<AckRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let user = payload
        .map(|Json(req)| req.user)
        .unwrap_or_else(|| "anonymous".to_string());
    let now = chrono::Utc::now().timestamp_millis();
    if !state.config_db.acknowledge_event(&id, &user, now)? {
        // Either the event is missing or it is not in TRIGGERED state.
        let exists = state.config_db.get_alarm_event(&id)?.is_some();
        return Err(if exists {
            ApiError::BadRequest("event is not in TRIGGERED state".to_string())
        } else {
            ApiError::NotFound("alarm event not found".to_string())
        });
    }
    let event = state
        .config_db
        .get_alarm_event(&id)?
        .ok_or_else(|| ApiError::Internal("failed to re-read event".to_string()))?;
    Ok(Json(event))
}

pub async fn resolve(
    State(state): State<AppState>,
    Path(id): Path<String>,
    _payload: Option<Json<AckRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let now = chrono::Utc::now().timestamp_millis();
    if !state.config_db.resolve_event(&id, now)? {
        let exists = state.config_db.get_alarm_event(&id)?.is_some();
        return Err(if exists {
            ApiError::BadRequest("event is already resolved".to_string())
        } else {
            ApiError::NotFound("alarm event not found".to_string())
        });
    }
    let event = state
        .config_db
        .get_alarm_event(&id)?
        .ok_or_else(|| ApiError::Internal("failed to re-read event".to_string()))?;
    Ok(Json(event))
}

pub async fn statistics(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let now = chrono::Utc::now().timestamp_millis();
    let stats = state.config_db.compute_alarm_statistics(now)?;
    state.config_db.save_alarm_statistics(&stats)?;
    Ok(Json(stats))
}
