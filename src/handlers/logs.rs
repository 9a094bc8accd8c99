//! Search endpoints: paged search, SSE streaming search and histograms,
//! time aggregation, catalogs and exports.

use std::convert::Infallible;

use axum::Json;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::AppState;
use crate::search::{ExportFormat, StreamEvent, default_interval_ms, interval_to_ms};

use super::{ApiError, SearchParams};

const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 1000;

fn page_size(params: &SearchParams) -> usize {
    params.page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
}

fn plan_and_range(
    state: &AppState,
    params: &SearchParams,
) -> Result<(crate::query::Plan, (i64, i64)), ApiError> {
    let plan = state.search.parse_plan(
        params.query.as_deref().unwrap_or(""),
        params.is_regex.unwrap_or(false),
    )?;
    let range = state.search.resolve_range(
        params.time_range.as_deref(),
        params.start_time,
        params.end_time,
    );
    Ok((plan, range))
}

pub async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<impl IntoResponse, ApiError> {
    let (plan, range) = plan_and_range(&state, &params)?;
    let page = state
        .search
        .search(&plan, range, params.page.unwrap_or(0), page_size(&params))?;
    Ok(Json(page))
}

pub async fn search_stream(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<impl IntoResponse, ApiError> {
    let (plan, range) = plan_and_range(&state, &params)?;
    let cancel = CancellationToken::new();
    let rx = state
        .search
        .search_stream(plan, range, page_size(&params), cancel.clone());
    // Dropping the SSE body (client gone) cancels the producing task.
    let guard = cancel.drop_guard();
    let stream = ReceiverStream::new(rx).map(move |event| {
        let _ = &guard;
        Ok::<Event, Infallible>(to_sse_event(event))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

pub async fn histogram_stream(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<impl IntoResponse, ApiError> {
    let (plan, range) = plan_and_range(&state, &params)?;
    let bucket_ms = match params.interval.as_deref() {
        Some(interval) => interval_to_ms(interval)
            .ok_or_else(|| ApiError::BadRequest(format!("bad interval: {interval}")))?,
        None => default_interval_ms(range.1 - range.0),
    };
    let cancel = CancellationToken::new();
    let rx = state
        .search
        .histogram_stream(plan, range, bucket_ms, cancel.clone());
    let guard = cancel.drop_guard();
    let stream = ReceiverStream::new(rx).map(move |event| {
        let _ = &guard;
        Ok::<Event, Infallible>(to_sse_event(event))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

pub async fn histogram(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<impl IntoResponse, ApiError> {
    let (plan, range) = plan_and_range(&state, &params)?;
    let bucket_ms = match params.interval.as_deref() {
        Some(interval) => interval_to_ms(interval)
            .ok_or_else(|| ApiError::BadRequest(format!("bad interval: {interval}")))?,
        None => default_interval_ms(range.1 - range.0),
    };
    let buckets = state.search.histogram(&plan, range, bucket_ms)?;
    Ok(Json(buckets))
}

pub async fn time_aggregation(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<impl IntoResponse, ApiError> {
    let (plan, range) = plan_and_range(&state, &params)?;
    let slots = params.slots.unwrap_or(24).clamp(1, 1000);
    let buckets = state.search.time_aggregation(&plan, range, slots)?;
    Ok(Json(buckets))
}

pub async fn count(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<impl IntoResponse, ApiError> {
    let (plan, range) = plan_and_range(&state, &params)?;
    let count = state.search.count(&plan, range)?;
    Ok(Json(serde_json::json!({ "count": count })))
}

pub async fn fields(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.index.fields()))
}

pub async fn sources(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.index.sources()))
}

pub async fn levels(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.index.levels()))
}

pub async fn export_csv(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<impl IntoResponse, ApiError> {
    export(state, params, ExportFormat::Csv).await
}

pub async fn export_json(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<impl IntoResponse, ApiError> {
    export(state, params, ExportFormat::Json).await
}

async fn export(
    state: AppState,
    params: SearchParams,
    format: ExportFormat,
) -> Result<impl IntoResponse, ApiError> {
    let (plan, range) = plan_and_range(&state, &params)?;
    let cancel = CancellationToken::new();
    let rx = state.search.export(plan, range, format, cancel.clone());
    let guard = cancel.drop_guard();
    let stream = ReceiverStream::new(rx).map(move |chunk| {
        let _ = &guard;
        chunk.map_err(std::io::Error::other)
    });

    let (content_type, filename) = match format {
        ExportFormat::Csv => ("text/csv; charset=utf-8", "logs.csv"),
        ExportFormat::Json => ("application/json", "logs.json"),
    };
    Ok((
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        Body::from_stream(stream),
    ))
}

fn to_sse_event(event: StreamEvent) -> Event {
    match event {
        StreamEvent::Page { items } => json_event("page", &serde_json::json!({ "items": items })),
        StreamEvent::Init { buckets } => json_event("init", &serde_json::json!({ "buckets": buckets })),
        StreamEvent::Hist { buckets } => json_event("hist", &serde_json::json!({ "buckets": buckets })),
        StreamEvent::Done { total, truncated } => json_event(
            "done",
            &serde_json::json!({ "total": total, "truncated": truncated }),
        ),
        StreamEvent::Error { message } => {
            json_event("error", &serde_json::json!({ "error": message }))
        }
    }
}

fn json_event(name: &str, payload: &serde_json::Value) -> Event {
    Event::default().event(name).data(payload.to_string())
}
