use crate::error::IngestError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Kind of a configured stream source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Rtsp,
    Rtmp,
    Webcam,
    File,
}

impl StreamKind {
    /// Detect the kind from a URL prefix. Plain integers are webcam indices,
    /// anything else without a scheme is treated as a local file.
    pub fn detect(url: &str) -> Self {
        let lower = url.to_ascii_lowercase();
        if lower.starts_with("rtsp://") {
            StreamKind::Rtsp
        } else if lower.starts_with("rtmp://") {
            StreamKind::Rtmp
        } else if url.parse::<u32>().is_ok() {
            StreamKind::Webcam
        } else {
            StreamKind::File
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Rtsp => "rtsp",
            StreamKind::Rtmp => "rtmp",
            StreamKind::Webcam => "webcam",
            StreamKind::File => "file",
        }
    }
}

impl std::str::FromStr for StreamKind {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rtsp" => Ok(StreamKind::Rtsp),
            "rtmp" => Ok(StreamKind::Rtmp),
            "webcam" => Ok(StreamKind::Webcam),
            "file" => Ok(StreamKind::File),
            other => Err(IngestError::UnsupportedType {
                stream_type: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw frame as produced by a decoder backend, before packetization
#[derive(Debug)]
pub struct DecodedFrame {
    /// BGR24 pixel data at the requested resize dimensions
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Blocking decoder backend behind the frame source.
///
/// Implementations decode one URL into BGR frames at the configured resize
/// dimensions. `read` must return within roughly `timeout`; returning
/// `FrameTimeout` signals stale I/O and triggers a reconnect. The capture
/// worker runs decoders on a dedicated blocking thread, so implementations
/// are free to block inside `read` up to the timeout.
pub trait FrameDecoder: Send {
    /// Open the source. Called once per (re)connection attempt.
    fn open(&mut self) -> Result<(), IngestError>;

    /// Read the next frame, waiting at most `timeout`.
    fn read(&mut self, timeout: Duration) -> Result<DecodedFrame, IngestError>;

    /// Release decoder resources. Must be safe to call more than once.
    fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_detection_from_url() {
        assert_eq!(StreamKind::detect("rtsp://cam/stream"), StreamKind::Rtsp);
        assert_eq!(StreamKind::detect("RTSP://CAM/STREAM"), StreamKind::Rtsp);
        assert_eq!(StreamKind::detect("rtmp://host/app"), StreamKind::Rtmp);
        assert_eq!(StreamKind::detect("0"), StreamKind::Webcam);
        assert_eq!(StreamKind::detect("/video/sample.mp4"), StreamKind::File);
        assert_eq!(StreamKind::detect("file:///video/a.mp4"), StreamKind::File);
    }

    #[test]
    fn test_kind_round_trip() {
        for kind in [
            StreamKind::Rtsp,
            StreamKind::Rtmp,
            StreamKind::Webcam,
            StreamKind::File,
        ] {
            assert_eq!(kind.as_str().parse::<StreamKind>().unwrap(), kind);
        }
        assert!("quic".parse::<StreamKind>().is_err());
    }
}
