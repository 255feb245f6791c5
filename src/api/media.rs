use crate::api::{fail, AppState};
use crate::frame::placeholder_jpeg;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Deserialize;
use std::io::SeekFrom;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::time::MissedTickBehavior;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

const MJPEG_BOUNDARY: &str = "frame";

/// Latest frame of a running stream as a JPEG
pub async fn snapshot(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let instance = match state.manager.get_instance(&id).await {
        Some(instance) => instance,
        None => return fail(StatusCode::NOT_FOUND, "stream is not running"),
    };

    let frame = match instance.ingestion.get_latest() {
        Some(frame) => frame,
        None => return fail(StatusCode::NOT_FOUND, "no frames available yet"),
    };

    match frame.to_jpeg(85) {
        Ok(jpeg) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "image/jpeg"),
                (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
            ],
            jpeg,
        )
            .into_response(),
        Err(e) => fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
pub struct MjpegQuery {
    fps: Option<u32>,
}

/// Live MJPEG preview.
///
/// Each part is `--frame\r\nContent-Type: image/jpeg\r\n\r\n<jpeg>\r\n`.
/// The client-requested fps is capped at 1..=30; a frame is only emitted
/// when its frame number advanced, and a placeholder is sent while the
/// stream has not yet produced frames.
pub async fn mjpeg(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<MjpegQuery>,
) -> Response {
    let fps = query.fps.unwrap_or(10);
    if !(1..=30).contains(&fps) {
        return fail(StatusCode::BAD_REQUEST, "fps must be between 1 and 30");
    }

    if state.manager.get_instance(&id).await.is_none() {
        return fail(StatusCode::NOT_FOUND, "stream is not running");
    }

    info!("MJPEG client connected to {} at {} fps", id, fps);
    let manager = state.manager.clone();
    let resize = (
        state.config.stream.resize_width,
        state.config.stream.resize_height,
    );

    let stream = async_stream::stream! {
        let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / fps as f64));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_frame_number = 0u64;
        let mut last_placeholder: Option<tokio::time::Instant> = None;

        loop {
            ticker.tick().await;

            // The worker exits when its next read sees the stream gone
            let instance = match manager.get_instance(&id).await {
                Some(instance) => instance,
                None => {
                    debug!("MJPEG client for {} disconnecting: stream gone", id);
                    break;
                }
            };

            match instance.ingestion.get_latest() {
                Some(frame) => {
                    // Never repeat the same frame twice in a row
                    if frame.frame_number == last_frame_number {
                        continue;
                    }
                    last_frame_number = frame.frame_number;

                    if let Ok(jpeg) = frame.to_jpeg(80) {
                        yield Ok::<_, axum::Error>(part_bytes(&jpeg));
                    }
                }
                None => {
                    // "Connecting" placeholder at 1 Hz until frames arrive
                    let due = last_placeholder
                        .map(|at| at.elapsed() >= Duration::from_secs(1))
                        .unwrap_or(true);
                    if due {
                        if let Ok(jpeg) = placeholder_jpeg(resize.0, resize.1) {
                            last_placeholder = Some(tokio::time::Instant::now());
                            yield Ok(part_bytes(&jpeg));
                        }
                    }
                }
            }
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={}", MJPEG_BOUNDARY),
        )
        .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(stream))
        .unwrap()
}

/// One multipart part in the exact wire format
fn part_bytes(jpeg: &[u8]) -> Bytes {
    let mut part = Vec::with_capacity(jpeg.len() + 64);
    part.extend_from_slice(
        format!("--{}\r\nContent-Type: image/jpeg\r\n\r\n", MJPEG_BOUNDARY).as_bytes(),
    );
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    Bytes::from(part)
}

/// MP4 clip with single-range HTTP Range support
pub async fn serve_clip(
    State(state): State<AppState>,
    Path(filename): Path<String>,
    headers: HeaderMap,
) -> Response {
    serve_media_file(&state, &filename, "video/mp4", Some(&headers)).await
}

/// JPEG thumbnail (no range handling)
pub async fn serve_thumbnail(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Response {
    serve_media_file(&state, &filename, "image/jpeg", None).await
}

async fn serve_media_file(
    state: &AppState,
    filename: &str,
    content_type: &'static str,
    headers: Option<&HeaderMap>,
) -> Response {
    if !is_safe_filename(filename) {
        return fail(StatusCode::BAD_REQUEST, "invalid filename");
    }

    let path = std::path::Path::new(&state.config.storage.clips_dir).join(filename);
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(_) => return fail(StatusCode::NOT_FOUND, "file not found"),
    };
    let size = match file.metadata().await {
        Ok(meta) => meta.len(),
        Err(e) => return fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    let range = headers
        .and_then(|h| h.get(header::RANGE))
        .and_then(|v| v.to_str().ok());

    match range {
        None => {
            let stream = ReaderStream::new(file);
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type)
                .header(header::CONTENT_LENGTH, size)
                .header(header::ACCEPT_RANGES, "bytes")
                .body(Body::from_stream(stream))
                .unwrap()
        }
        Some(raw) => match parse_range(raw, size) {
            Some((start, end)) => {
                let mut file = file;
                if file.seek(SeekFrom::Start(start)).await.is_err() {
                    return fail(StatusCode::INTERNAL_SERVER_ERROR, "seek failed");
                }
                let len = end - start + 1;
                let stream = ReaderStream::new(file.take(len));
                Response::builder()
                    .status(StatusCode::PARTIAL_CONTENT)
                    .header(header::CONTENT_TYPE, content_type)
                    .header(header::CONTENT_LENGTH, len)
                    .header(header::ACCEPT_RANGES, "bytes")
                    .header(
                        header::CONTENT_RANGE,
                        format!("bytes {}-{}/{}", start, end, size),
                    )
                    .body(Body::from_stream(stream))
                    .unwrap()
            }
            None => Response::builder()
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(header::CONTENT_RANGE, format!("bytes */{}", size))
                .body(Body::empty())
                .unwrap(),
        },
    }
}

/// Accept only plain basenames; anything resembling traversal is rejected
fn is_safe_filename(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 255
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !name.contains("..")
}

/// Parse a single `bytes=` range against a file of `size` bytes.
/// Returns an inclusive (start, end) pair, or None when unsatisfiable.
fn parse_range(raw: &str, size: u64) -> Option<(u64, u64)> {
    if size == 0 {
        return None;
    }
    let spec = raw.strip_prefix("bytes=")?.trim();
    // Multi-range requests are not supported
    if spec.contains(',') {
        return None;
    }

    let (start_raw, end_raw) = spec.split_once('-')?;
    match (start_raw.trim(), end_raw.trim()) {
        // bytes=-suffix: the trailing N bytes
        ("", suffix) => {
            let n: u64 = suffix.parse().ok()?;
            if n == 0 {
                return None;
            }
            let start = size.saturating_sub(n);
            Some((start, size - 1))
        }
        // bytes=start-
        (start, "") => {
            let start: u64 = start.parse().ok()?;
            if start >= size {
                return None;
            }
            Some((start, size - 1))
        }
        // bytes=start-end
        (start, end) => {
            let start: u64 = start.parse().ok()?;
            let end: u64 = end.parse().ok()?;
            if start > end || start >= size {
                return None;
            }
            Some((start, end.min(size - 1)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range_forms() {
        assert_eq!(parse_range("bytes=0-499", 1000), Some((0, 499)));
        assert_eq!(parse_range("bytes=500-", 1000), Some((500, 999)));
        assert_eq!(parse_range("bytes=-200", 1000), Some((800, 999)));
        // End clamped to file size
        assert_eq!(parse_range("bytes=900-2000", 1000), Some((900, 999)));
        // Suffix longer than the file serves the whole file
        assert_eq!(parse_range("bytes=-5000", 1000), Some((0, 999)));
    }

    #[test]
    fn test_parse_range_rejects_unsatisfiable() {
        assert_eq!(parse_range("bytes=1000-1001", 1000), None);
        assert_eq!(parse_range("bytes=500-100", 1000), None);
        assert_eq!(parse_range("bytes=-0", 1000), None);
        assert_eq!(parse_range("frames=0-10", 1000), None);
        assert_eq!(parse_range("bytes=0-10,20-30", 1000), None);
        assert_eq!(parse_range("bytes=abc-def", 1000), None);
        assert_eq!(parse_range("bytes=0-10", 0), None);
    }

    #[test]
    fn test_safe_filename_rules() {
        assert!(is_safe_filename("s1_e1_20250101_120000.mp4"));
        assert!(is_safe_filename("cam_evt_thumb.jpg"));
        assert!(!is_safe_filename("../etc/passwd"));
        assert!(!is_safe_filename("a/b.mp4"));
        assert!(!is_safe_filename(".hidden"));
        assert!(!is_safe_filename(""));
        assert!(!is_safe_filename("a b.mp4"));
    }

    #[test]
    fn test_mjpeg_part_wire_format() {
        let jpeg = vec![0xFFu8, 0xD8, 0xFF, 0xD9];
        let part = part_bytes(&jpeg);
        let text = part.as_ref();

        assert!(text.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n"));
        assert!(text.ends_with(b"\xFF\xD9\r\n"));
    }
}
