use crate::error::IngestError;
use crate::ingest::decoder::{DecodedFrame, FrameDecoder, StreamKind};
use gstreamer::prelude::*;
use gstreamer::Pipeline;
use gstreamer_app::AppSink;
use std::time::Duration;
use tracing::{debug, info, warn};

/// GStreamer-backed decoder for RTSP/RTMP/webcam/file sources.
///
/// Frames are converted and scaled to BGR at the requested dimensions inside
/// the pipeline; the appsink is configured to keep only the newest buffer so
/// slow consumers never accumulate latency.
pub struct GstDecoder {
    url: String,
    kind: StreamKind,
    width: u32,
    height: u32,
    pipeline: Option<Pipeline>,
    appsink: Option<AppSink>,
}

impl GstDecoder {
    pub fn new(url: &str, kind: StreamKind, width: u32, height: u32) -> Self {
        Self {
            url: url.to_string(),
            kind,
            width,
            height,
            pipeline: None,
            appsink: None,
        }
    }

    fn pipeline_description(&self) -> String {
        let caps = format!(
            "video/x-raw,format=BGR,width={},height={}",
            self.width, self.height
        );
        let sink = format!(
            "videoconvert ! videoscale ! {caps} ! \
             appsink name=sink sync=false max-buffers=1 drop=true"
        );

        match self.kind {
            // TCP transport, no reorder queue, minimal analysis window
            StreamKind::Rtsp => format!(
                "rtspsrc location={} protocols=tcp latency=0 drop-on-latency=true \
                 tcp-timeout=5000000 ! decodebin ! {sink}",
                self.url
            ),
            StreamKind::Rtmp => format!("rtmpsrc location={} ! decodebin ! {sink}", self.url),
            StreamKind::Webcam => {
                let device = self
                    .url
                    .parse::<u32>()
                    .map(|n| format!("/dev/video{}", n))
                    .unwrap_or_else(|_| self.url.clone());
                format!("v4l2src device={} ! decodebin ! {sink}", device)
            }
            StreamKind::File => {
                let path = self
                    .url
                    .strip_prefix("file://")
                    .unwrap_or(&self.url)
                    .to_string();
                format!("filesrc location={} ! decodebin ! {sink}", path)
            }
        }
    }
}

impl FrameDecoder for GstDecoder {
    fn open(&mut self) -> Result<(), IngestError> {
        gstreamer::init().map_err(|e| IngestError::SourceOpen {
            url: self.url.clone(),
            details: format!("GStreamer init failed: {}", e),
        })?;

        let desc = self.pipeline_description();
        debug!("Decoder pipeline: {}", desc);

        let pipeline = gstreamer::parse::launch(&desc)
            .map_err(|e| IngestError::SourceOpen {
                url: self.url.clone(),
                details: e.to_string(),
            })?
            .downcast::<Pipeline>()
            .map_err(|_| IngestError::SourceOpen {
                url: self.url.clone(),
                details: "failed to downcast to Pipeline".to_string(),
            })?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| IngestError::SourceOpen {
                url: self.url.clone(),
                details: "appsink element missing".to_string(),
            })?
            .downcast::<AppSink>()
            .map_err(|_| IngestError::SourceOpen {
                url: self.url.clone(),
                details: "failed to downcast to AppSink".to_string(),
            })?;

        pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|e| IngestError::SourceOpen {
                url: self.url.clone(),
                details: format!("failed to start pipeline: {}", e),
            })?;

        info!("Decoder pipeline started for {}", self.url);
        self.pipeline = Some(pipeline);
        self.appsink = Some(appsink);
        Ok(())
    }

    fn read(&mut self, timeout: Duration) -> Result<DecodedFrame, IngestError> {
        let appsink = self.appsink.as_ref().ok_or(IngestError::Disconnected)?;

        let clock_timeout = gstreamer::ClockTime::from_nseconds(timeout.as_nanos() as u64);
        let sample = match appsink.try_pull_sample(clock_timeout) {
            Some(sample) => sample,
            None => {
                if appsink.is_eos() {
                    return Err(IngestError::Disconnected);
                }
                return Err(IngestError::FrameTimeout { timeout });
            }
        };

        let buffer = sample.buffer().ok_or_else(|| IngestError::DecodeRead {
            details: "sample without buffer".to_string(),
        })?;
        let map = buffer.map_readable().map_err(|e| IngestError::DecodeRead {
            details: e.to_string(),
        })?;

        let expected = self.width as usize * self.height as usize * 3;
        if map.len() < expected {
            return Err(IngestError::DecodeRead {
                details: format!("short buffer: {} < {}", map.len(), expected),
            });
        }

        Ok(DecodedFrame {
            data: map.as_slice()[..expected].to_vec(),
            width: self.width,
            height: self.height,
        })
    }

    fn close(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            if let Err(e) = pipeline.set_state(gstreamer::State::Null) {
                warn!("Failed to stop decoder pipeline: {}", e);
            }
        }
        self.appsink = None;
    }
}

impl Drop for GstDecoder {
    fn drop(&mut self) {
        self.close();
    }
}
