use crate::api::{error_response, fail, ok, ok_paged, respond, AppState};
use crate::classify::FrameClassifier as _;
use crate::db::{EventFilter, EventRepository as _, EventStatus};
use crate::ingest::StreamKind;
use crate::manager::{AddStreamRequest, StreamPatch};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

pub async fn health(State(state): State<AppState>) -> Response {
    ok(json!({
        "status": "ok",
        "streams_count": state.manager.streams_count().await,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CreateStreamBody {
    name: String,
    url: String,
    stream_type: Option<String>,
    location: Option<String>,
    #[serde(default)]
    auto_start: bool,
    custom_threshold: Option<f64>,
}

pub async fn create_stream(
    State(state): State<AppState>,
    Json(body): Json<CreateStreamBody>,
) -> Response {
    let stream_type = match body.stream_type.as_deref() {
        Some(raw) => match raw.parse::<StreamKind>() {
            Ok(kind) => Some(kind),
            Err(e) => return fail(StatusCode::BAD_REQUEST, e.to_string()),
        },
        None => None,
    };

    if let Some(threshold) = body.custom_threshold {
        if !(0.0..=1.0).contains(&threshold) {
            return fail(StatusCode::BAD_REQUEST, "custom_threshold must be in [0, 1]");
        }
    }

    let result = state
        .manager
        .add_stream(AddStreamRequest {
            name: body.name,
            url: body.url,
            stream_type,
            location: body.location,
            auto_start: body.auto_start,
            custom_threshold: body.custom_threshold,
        })
        .await
        .map(|stream_id| json!({ "stream_id": stream_id }));
    respond(result)
}

pub async fn list_streams(State(state): State<AppState>) -> Response {
    ok(state.manager.get_all_status().await)
}

pub async fn get_stream(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(state.manager.get_status(&id).await)
}

#[derive(Debug, Deserialize)]
pub struct UpdateStreamBody {
    name: Option<String>,
    url: Option<String>,
    location: Option<String>,
    target_fps: Option<u32>,
    custom_threshold: Option<f64>,
    custom_window_seconds: Option<u32>,
}

pub async fn update_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateStreamBody>,
) -> Response {
    let patch = StreamPatch {
        name: body.name,
        url: body.url,
        location: body.location,
        target_fps: body.target_fps,
        custom_threshold: body.custom_threshold.map(Some),
        custom_window_seconds: body.custom_window_seconds.map(Some),
    };

    match state.manager.update_stream(&id, patch).await {
        Ok((record, restart_required)) => ok(json!({
            "stream": record,
            "restart_required": restart_required,
        })),
        Err(e) => error_response(e),
    }
}

pub async fn start_stream(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(
        state
            .manager
            .start_stream(&id)
            .await
            .map(|()| json!({ "stream_id": id, "status": "started" })),
    )
}

pub async fn stop_stream(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(
        state
            .manager
            .stop_stream(&id)
            .await
            .map(|()| json!({ "stream_id": id, "status": "stopped" })),
    )
}

pub async fn remove_stream(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(
        state
            .manager
            .remove_stream(&id)
            .await
            .map(|()| json!({ "stream_id": id, "status": "removed" })),
    )
}

pub async fn prediction(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.manager.get_instance(&id).await {
        Some(instance) => match instance.scheduler.last_score() {
            Some(score) => ok(score),
            None => fail(StatusCode::NOT_FOUND, "no inference result yet"),
        },
        None => fail(StatusCode::NOT_FOUND, "stream is not running"),
    }
}

#[derive(Debug, Deserialize)]
pub struct EventListQuery {
    status: Option<String>,
    stream_id: Option<String>,
    limit: Option<u32>,
    offset: Option<u32>,
    start_after: Option<DateTime<Utc>>,
    start_before: Option<DateTime<Utc>>,
}

pub async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<EventListQuery>,
) -> Response {
    let status = match query.status.as_deref() {
        Some(raw) => match raw.parse::<EventStatus>() {
            Ok(status) => Some(status),
            Err(e) => return fail(StatusCode::BAD_REQUEST, e),
        },
        None => None,
    };

    let limit = query.limit.unwrap_or(50).min(500);
    let offset = query.offset.unwrap_or(0);
    let filter = EventFilter {
        status,
        stream_id: query.stream_id,
        limit: Some(limit),
        offset: Some(offset),
        start_after: query.start_after,
        start_before: query.start_before,
    };

    let total = match state.events.count(&filter).await {
        Ok(total) => total,
        Err(e) => return error_response(e.into()),
    };
    match state.events.list(filter).await {
        Ok(events) => ok_paged(events, total, limit, offset),
        Err(e) => error_response(e.into()),
    }
}

pub async fn get_event(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(state.events.get_by_id(&id).await.map_err(Into::into))
}

#[derive(Debug, Deserialize, Default)]
pub struct ReviewBody {
    reviewed_by: Option<String>,
    notes: Option<String>,
}

async fn review_event(
    state: AppState,
    id: String,
    status: EventStatus,
    body: Option<ReviewBody>,
) -> Response {
    let body = body.unwrap_or_default();
    respond(
        state
            .events
            .update_status(&id, status, body.reviewed_by, body.notes)
            .await
            .map_err(Into::into),
    )
}

pub async fn confirm_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<ReviewBody>>,
) -> Response {
    review_event(state, id, EventStatus::Confirmed, body.map(|Json(b)| b)).await
}

pub async fn dismiss_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<ReviewBody>>,
) -> Response {
    review_event(state, id, EventStatus::Dismissed, body.map(|Json(b)| b)).await
}

pub async fn action_executed_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<ReviewBody>>,
) -> Response {
    review_event(state, id, EventStatus::ActionExecuted, body.map(|Json(b)| b)).await
}

pub async fn no_action_required_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<ReviewBody>>,
) -> Response {
    review_event(
        state,
        id,
        EventStatus::NoActionRequired,
        body.map(|Json(b)| b),
    )
    .await
}

#[derive(Debug, Deserialize)]
pub struct StatisticsQuery {
    days: Option<u32>,
}

pub async fn event_statistics(
    State(state): State<AppState>,
    Query(query): Query<StatisticsQuery>,
) -> Response {
    let days = query.days.unwrap_or(7).clamp(1, 365);
    respond(state.events.statistics(days).await.map_err(Into::into))
}

pub async fn model_status(State(state): State<AppState>) -> Response {
    ok(json!({
        "loaded": state.classifier.is_loaded(),
        "backend": state.classifier.describe(),
        "model_path": state.config.classifier.model_path,
        "threshold": state.config.detection.violence_threshold,
        "alert_threshold": state.config.detection.alert_threshold,
        "inference_interval_ms": state.config.stream.inference_interval_ms,
        "window_frames": state.config.stream.frame_sample_rate,
    }))
}
