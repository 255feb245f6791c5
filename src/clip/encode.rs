//! H.264 MP4 encoding of frame lists.
//!
//! The real encoder rides on GStreamer behind the `encode-gstreamer`
//! feature; without it `encode_mp4` reports the backend as unavailable and
//! events finalize without clip artifacts.

use crate::error::ClipError;
use crate::frame::FramePacket;
use std::path::Path;

#[cfg(all(target_os = "linux", feature = "encode-gstreamer"))]
pub fn encode_mp4(
    frames: &[FramePacket],
    video_path: &Path,
    fps: u32,
) -> Result<(), ClipError> {
    use gstreamer::prelude::*;
    use gstreamer::Pipeline;
    use gstreamer_app::AppSrc;
    use tracing::{debug, info};

    if frames.is_empty() {
        return Err(ClipError::EmptyInput);
    }

    // Encoding runs below the capture/inference workers
    {
        use libc::{setpriority, PRIO_PROCESS};
        let _ = unsafe { setpriority(PRIO_PROCESS as u32, 0, 10) };
    }

    gstreamer::init().map_err(|e| ClipError::Encoding {
        details: format!("GStreamer init failed: {}", e),
    })?;

    let first = &frames[0];
    let pipeline_desc = format!(
        "appsrc name=src format=time is-live=false \
         caps=video/x-raw,format=BGR,width={w},height={h},framerate={fps}/1 ! \
         videoconvert ! video/x-raw,format=I420 ! \
         x264enc speed-preset=ultrafast pass=quant quantizer=23 key-int-max=60 ! \
         h264parse ! \
         mp4mux faststart=true ! \
         filesink location={path}",
        w = first.width,
        h = first.height,
        fps = fps,
        path = video_path.to_string_lossy()
    );

    debug!("Encoder pipeline: {}", pipeline_desc);

    let pipeline = gstreamer::parse::launch(&pipeline_desc)
        .map_err(|e| ClipError::Encoding {
            details: format!("failed to create pipeline: {}", e),
        })?
        .downcast::<Pipeline>()
        .map_err(|_| ClipError::Encoding {
            details: "failed to downcast to Pipeline".to_string(),
        })?;

    let appsrc = pipeline
        .by_name("src")
        .ok_or_else(|| ClipError::Encoding {
            details: "appsrc element missing".to_string(),
        })?
        .downcast::<AppSrc>()
        .map_err(|_| ClipError::Encoding {
            details: "failed to downcast to AppSrc".to_string(),
        })?;

    pipeline
        .set_state(gstreamer::State::Playing)
        .map_err(|e| ClipError::Encoding {
            details: format!("failed to start pipeline: {}", e),
        })?;

    let frame_duration_ns = 1_000_000_000u64 / fps.max(1) as u64;

    for (index, frame) in frames.iter().enumerate() {
        let mut buffer =
            gstreamer::Buffer::with_size(frame.data.len()).map_err(|e| ClipError::Encoding {
                details: format!("failed to create buffer: {}", e),
            })?;

        {
            let buffer_ref = buffer.get_mut().unwrap();
            let mut map = buffer_ref.map_writable().map_err(|e| ClipError::Encoding {
                details: format!("failed to map buffer: {}", e),
            })?;
            map.copy_from_slice(&frame.data);
        }

        // Gaps in frame numbers are tolerated: the writer paces at fps
        let pts = index as u64 * frame_duration_ns;
        buffer
            .get_mut()
            .unwrap()
            .set_pts(gstreamer::ClockTime::from_nseconds(pts));
        buffer
            .get_mut()
            .unwrap()
            .set_duration(gstreamer::ClockTime::from_nseconds(frame_duration_ns));

        appsrc.push_buffer(buffer).map_err(|e| ClipError::Encoding {
            details: format!("failed to push buffer: {:?}", e),
        })?;
    }

    appsrc.end_of_stream().map_err(|e| ClipError::Encoding {
        details: format!("failed to signal EOS: {:?}", e),
    })?;

    let bus = pipeline.bus().unwrap();
    let mut completed = false;
    for msg in bus.iter_timed(gstreamer::ClockTime::from_seconds(60)) {
        match msg.view() {
            gstreamer::MessageView::Eos(..) => {
                completed = true;
                break;
            }
            gstreamer::MessageView::Error(err) => {
                let details = format!(
                    "encoding error: {} ({})",
                    err.error(),
                    err.debug().unwrap_or_default()
                );
                let _ = pipeline.set_state(gstreamer::State::Null);
                return Err(ClipError::Encoding { details });
            }
            _ => {}
        }
    }

    pipeline
        .set_state(gstreamer::State::Null)
        .map_err(|e| ClipError::Encoding {
            details: format!("failed to stop pipeline: {}", e),
        })?;

    if !completed {
        return Err(ClipError::Encoding {
            details: "encoder did not reach EOS within 60s".to_string(),
        });
    }

    info!(
        "Encoded {} frames to {}",
        frames.len(),
        video_path.display()
    );
    Ok(())
}

#[cfg(not(all(target_os = "linux", feature = "encode-gstreamer")))]
pub fn encode_mp4(
    frames: &[FramePacket],
    _video_path: &Path,
    _fps: u32,
) -> Result<(), ClipError> {
    if frames.is_empty() {
        return Err(ClipError::EmptyInput);
    }
    Err(ClipError::EncoderNotAvailable)
}
