pub mod encode;
pub mod person;

pub use person::{BoundingBox, PersonCapture, PersonDetector};

use crate::error::{ClipError, Result};
use crate::frame::FramePacket;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// Artifacts produced for one finalized event
#[derive(Debug, Clone)]
pub struct ClipArtifacts {
    pub mp4_path: PathBuf,
    pub thumbnail_path: PathBuf,
    pub duration_seconds: f64,
}

/// Encodes finalized frame lists into browser-playable evidence clips.
///
/// Output is H.264/yuv420p MP4 with the moov atom up front so clips stream
/// over HTTP Range, plus a JPEG thumbnail from the middle frame. Concurrent
/// encodes are bounded so a burst of finalizing events cannot starve the
/// capture and inference workers.
pub struct ClipRecorder {
    clips_dir: PathBuf,
    fps: u32,
    encode_slots: Arc<Semaphore>,
}

impl ClipRecorder {
    pub fn new<P: AsRef<Path>>(clips_dir: P, fps: u32) -> Result<Self> {
        let clips_dir = clips_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&clips_dir).map_err(|e| ClipError::DirectoryCreation {
            path: clips_dir.display().to_string(),
            source: e,
        })?;

        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let slots = parallelism.min(4).max(1);

        Ok(Self {
            clips_dir,
            fps: fps.max(1),
            encode_slots: Arc::new(Semaphore::new(slots)),
        })
    }

    pub fn clips_dir(&self) -> &Path {
        &self.clips_dir
    }

    /// Encode `frames` into an MP4 + thumbnail pair for the given event.
    ///
    /// Frames must be ordered; gaps are tolerated, the writer paces output
    /// at the configured fps. On any failure partial files are deleted and
    /// the event is left clip-less.
    pub async fn record(
        &self,
        frames: &[FramePacket],
        stream_id: &str,
        event_id: &str,
    ) -> Result<ClipArtifacts> {
        if frames.is_empty() {
            return Err(ClipError::EmptyInput.into());
        }

        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let base = format!(
            "{}_{}_{}",
            sanitize_filename(stream_id),
            sanitize_filename(event_id),
            stamp
        );
        let mp4_path = self.clips_dir.join(format!("{}.mp4", base));
        let thumbnail_path = self.clips_dir.join(format!("{}_thumb.jpg", base));

        let permit = self
            .encode_slots
            .acquire()
            .await
            .expect("encode semaphore closed");

        let encode_frames = frames.to_vec();
        let encode_path = mp4_path.clone();
        let fps = self.fps;
        let encode_result = tokio::task::spawn_blocking(move || {
            encode::encode_mp4(&encode_frames, &encode_path, fps)
        })
        .await
        .map_err(|e| ClipError::Encoding {
            details: format!("encode task failed: {}", e),
        })?;
        drop(permit);

        if let Err(e) = encode_result {
            remove_partial(&mp4_path);
            return Err(e.into());
        }

        let middle = &frames[frames.len() / 2];
        let jpeg = match middle.to_jpeg(85) {
            Ok(data) => data,
            Err(e) => {
                remove_partial(&mp4_path);
                return Err(e);
            }
        };
        if let Err(e) = tokio::fs::write(&thumbnail_path, &jpeg).await {
            remove_partial(&mp4_path);
            remove_partial(&thumbnail_path);
            return Err(ClipError::Thumbnail {
                details: e.to_string(),
            }
            .into());
        }

        let duration_seconds = frames.len() as f64 / self.fps as f64;
        info!(
            "Saved clip {} ({} frames, {:.1}s)",
            mp4_path.display(),
            frames.len(),
            duration_seconds
        );

        Ok(ClipArtifacts {
            mp4_path,
            thumbnail_path,
            duration_seconds,
        })
    }
}

fn remove_partial(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            warn!("Failed to delete partial file {}: {}", path.display(), e);
        }
    }
}

/// Restrict a name to a filesystem-safe character set
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
