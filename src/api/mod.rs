pub mod handlers;
pub mod media;
pub mod ws;

use crate::classify::FrameClassifier;
use crate::config::VigilConfig;
use crate::db::EventRepository;
use crate::error::{ApiError, ManagerError, RepositoryError, Result, VigilError};
use crate::hub::BroadcastHub;
use crate::manager::StreamManager;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared state injected into every handler
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<StreamManager>,
    pub events: Arc<dyn EventRepository>,
    pub hub: BroadcastHub,
    pub classifier: Arc<dyn FrameClassifier>,
    pub config: Arc<VigilConfig>,
}

/// Uniform `{success, data, error, pagination}` envelope
pub fn ok<T: Serialize>(data: T) -> Response {
    (
        StatusCode::OK,
        Json(json!({ "success": true, "data": data })),
    )
        .into_response()
}

pub fn ok_paged<T: Serialize>(data: T, total: u64, limit: u32, offset: u32) -> Response {
    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "data": data,
            "pagination": { "total": total, "limit": limit, "offset": offset },
        })),
    )
        .into_response()
}

pub fn fail(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "success": false, "error": error.into() })),
    )
        .into_response()
}

/// Map domain errors onto HTTP: client faults are 4xx, the rest 5xx
pub fn error_response(err: VigilError) -> Response {
    let status = match &err {
        VigilError::Manager(ManagerError::StreamNotFound { .. }) => StatusCode::NOT_FOUND,
        VigilError::Manager(ManagerError::AlreadyRunning { .. }) => StatusCode::CONFLICT,
        VigilError::Manager(ManagerError::NotRunning { .. }) => StatusCode::CONFLICT,
        VigilError::Manager(ManagerError::InvalidConfig { .. }) => StatusCode::BAD_REQUEST,
        VigilError::Repository(RepositoryError::StreamNotFound { .. }) => StatusCode::NOT_FOUND,
        VigilError::Repository(RepositoryError::EventNotFound { .. }) => StatusCode::NOT_FOUND,
        VigilError::Repository(RepositoryError::AlreadyReviewed { .. }) => StatusCode::CONFLICT,
        VigilError::Ingest(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    fail(status, err.to_string())
}

/// Shorthand for handlers returning domain results
pub fn respond<T: Serialize>(result: Result<T>) -> Response {
    match result {
        Ok(data) => ok(data),
        Err(err) => error_response(err),
    }
}

/// Build the full application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/health", get(handlers::health))
        .route(
            "/api/v1/streams",
            post(handlers::create_stream).get(handlers::list_streams),
        )
        .route(
            "/api/v1/streams/:id",
            get(handlers::get_stream)
                .patch(handlers::update_stream)
                .delete(handlers::remove_stream),
        )
        .route("/api/v1/streams/:id/start", post(handlers::start_stream))
        .route("/api/v1/streams/:id/stop", post(handlers::stop_stream))
        .route("/api/v1/streams/:id/snapshot", get(media::snapshot))
        .route("/api/v1/streams/:id/mjpeg", get(media::mjpeg))
        .route("/api/v1/streams/:id/prediction", get(handlers::prediction))
        .route("/api/v1/events", get(handlers::list_events))
        .route("/api/v1/events/statistics", get(handlers::event_statistics))
        .route("/api/v1/events/:id", get(handlers::get_event))
        .route("/api/v1/events/:id/confirm", post(handlers::confirm_event))
        .route("/api/v1/events/:id/dismiss", post(handlers::dismiss_event))
        .route(
            "/api/v1/events/:id/action-executed",
            post(handlers::action_executed_event),
        )
        .route(
            "/api/v1/events/:id/no-action-required",
            post(handlers::no_action_required_event),
        )
        .route("/api/v1/clips/:filename", get(media::serve_clip))
        .route("/api/v1/thumbnails/:filename", get(media::serve_thumbnail))
        .route("/api/v1/model/status", get(handlers::model_status))
        .route("/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ScriptedClassifier;
    use crate::clip::ClipRecorder;
    use crate::db::{Database, NewEvent, SqliteEventRepository, SqliteStreamRepository};
    use crate::ingest::{DecoderFactory, StreamSpec, SyntheticDecoder};
    use crate::manager::StreamManager;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use serde_json::Value;
    use tower::ServiceExt;

    fn synthetic_factory() -> DecoderFactory {
        Arc::new(|spec: &StreamSpec| {
            Ok(Box::new(SyntheticDecoder::new(
                spec.resize_width,
                spec.resize_height,
                spec.target_fps,
            )) as Box<dyn crate::ingest::FrameDecoder>)
        })
    }

    async fn test_state() -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().await.unwrap();
        let stream_repo = Arc::new(SqliteStreamRepository::new(db.clone()));
        let event_repo = Arc::new(SqliteEventRepository::new(db));

        let mut config = VigilConfig::default();
        config.storage.clips_dir = dir.path().join("clips").display().to_string();
        config.stream.resize_width = 16;
        config.stream.resize_height = 12;

        let classifier: Arc<dyn FrameClassifier> = Arc::new(ScriptedClassifier::constant(0.1));
        let recorder = Arc::new(ClipRecorder::new(&config.storage.clips_dir, 30).unwrap());
        let hub = BroadcastHub::new(64);

        let manager = Arc::new(StreamManager::new(
            config.clone(),
            stream_repo,
            Arc::clone(&event_repo) as Arc<dyn crate::db::EventRepository>,
            hub.clone(),
            Arc::clone(&classifier),
            recorder,
            None,
            synthetic_factory(),
        ));

        let state = AppState {
            manager,
            events: event_repo,
            hub,
            classifier,
            config: Arc::new(config),
        };
        (state, dir)
    }

    async fn send(state: &AppState, request: Request<Body>) -> (StatusCode, Value) {
        let response = router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_health_envelope() {
        let (state, _dir) = test_state().await;
        let (status, json) = send(&state, get("/api/v1/health")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["status"], "ok");
        assert_eq!(json["data"]["streams_count"], 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stream_create_and_fetch() {
        let (state, _dir) = test_state().await;

        let (status, json) = send(
            &state,
            post(
                "/api/v1/streams",
                serde_json::json!({ "name": "cam-1", "url": "rtsp://cam/main" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let id = json["data"]["stream_id"].as_str().unwrap().to_string();

        let (status, json) = send(&state, get(&format!("/api/v1/streams/{}", id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["stream"]["name"], "cam-1");
        assert_eq!(json["data"]["stream"]["stream_type"], "rtsp");
        assert_eq!(json["data"]["stream"]["is_running"], false);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unknown_stream_is_404_with_envelope() {
        let (state, _dir) = test_state().await;
        let (status, json) = send(&state, get("/api/v1/streams/nope")).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["success"], false);
        assert!(json["error"].is_string());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_events_list_pagination_envelope() {
        let (state, _dir) = test_state().await;
        let (status, json) = send(&state, get("/api/v1/events?limit=10&offset=0")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
        assert_eq!(json["pagination"]["total"], 0);
        assert_eq!(json["pagination"]["limit"], 10);
        assert!(json["data"].as_array().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_event_review_flow_over_http() {
        let (state, _dir) = test_state().await;
        let event = state
            .events
            .create(NewEvent {
                id: "e1".to_string(),
                stream_id: "s1".to_string(),
                stream_name: "cam".to_string(),
                start_ts: Utc::now(),
                opening_score: 0.8,
                frame_count: 16,
            })
            .await
            .unwrap();

        let (status, json) = send(
            &state,
            post(
                &format!("/api/v1/events/{}/confirm", event.id),
                serde_json::json!({ "reviewed_by": "operator" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["status"], "CONFIRMED");

        // Terminal status: a second review is rejected
        let (status, json) = send(
            &state,
            post(
                &format!("/api/v1/events/{}/dismiss", event.id),
                serde_json::json!({}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["success"], false);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_clip_filename_validation_and_missing_file() {
        let (state, _dir) = test_state().await;

        let (status, _) = send(&state, get("/api/v1/clips/..%2Fetc%2Fpasswd")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, json) = send(&state, get("/api/v1/clips/absent.mp4")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["success"], false);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_clip_range_serving() {
        let (state, dir) = test_state().await;
        let clips = dir.path().join("clips");
        std::fs::write(clips.join("c.mp4"), b"0123456789").unwrap();

        // Full file without a Range header
        let response = router(state.clone())
            .oneshot(get("/api/v1/clips/c.mp4"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["accept-ranges"], "bytes");
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"0123456789");

        // Partial content with Content-Range
        let request = Request::builder()
            .uri("/api/v1/clips/c.mp4")
            .header("range", "bytes=2-5")
            .body(Body::empty())
            .unwrap();
        let response = router(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()["content-range"], "bytes 2-5/10");
        assert_eq!(response.headers()["content-length"], "4");
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"2345");

        // Unsatisfiable range
        let request = Request::builder()
            .uri("/api/v1/clips/c.mp4")
            .header("range", "bytes=50-60")
            .body(Body::empty())
            .unwrap();
        let response = router(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(response.headers()["content-range"], "bytes */10");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_model_status_reports_thresholds() {
        let (state, _dir) = test_state().await;
        let (status, json) = send(&state, get("/api/v1/model/status")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["loaded"], true);
        assert_eq!(json["data"]["threshold"], 0.5);
        assert_eq!(json["data"]["alert_threshold"], 0.9);
        assert_eq!(json["data"]["window_frames"], 16);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_mjpeg_rejects_bad_fps() {
        let (state, _dir) = test_state().await;
        let id = state
            .manager
            .add_stream(crate::manager::AddStreamRequest {
                name: "cam".to_string(),
                url: "synthetic://test".to_string(),
                stream_type: None,
                location: None,
                auto_start: false,
                custom_threshold: None,
            })
            .await
            .unwrap();

        let (status, _) = send(&state, get(&format!("/api/v1/streams/{}/mjpeg?fps=99", id))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // Not running: 404 rather than a hanging stream
        let (status, _) = send(&state, get(&format!("/api/v1/streams/{}/mjpeg?fps=5", id))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}

/// Bind and serve until the shutdown future resolves
pub async fn serve(
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let app = router(state);

    info!("API server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ApiError::BindFailed {
            address: addr.clone(),
            source: e,
        })?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ApiError::Server {
            details: e.to_string(),
        })?;

    Ok(())
}
