use axum::Json;
use axum::extract::State;
use axum::response::IntoResponse;

use crate::AppState;

/// Liveness plus the operator-facing signals: index degraded state and
/// buffer metrics.
pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": if state.index.is_degraded() { "degraded" } else { "ok" },
        "indexDegraded": state.index.is_degraded(),
        "records": state.index.total_count(),
        "buffer": state.buffer.metrics(),
    }))
}
