use crate::error::{ClipError, Result};
use image::codecs::jpeg::JpegEncoder;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// A single decoded frame with metadata.
///
/// Pixel data is BGR24, resized to the stream's configured dimensions before
/// buffering. The byte buffer is shared so copies between the ring buffer,
/// pre-roll snapshots and clip assembly never duplicate pixels.
#[derive(Debug, Clone)]
pub struct FramePacket {
    /// Raw BGR pixel data (shared ownership for efficiency)
    pub data: Arc<Vec<u8>>,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Wall-clock capture time
    pub timestamp: SystemTime,
    /// Monotonic capture time, used for age and window computations
    pub monotonic: Instant,
    /// Per-stream counter, strictly increasing and contiguous from 1
    pub frame_number: u64,
    /// Owning stream id
    pub stream_id: String,
}

impl FramePacket {
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        frame_number: u64,
        stream_id: String,
    ) -> Self {
        Self {
            data: Arc::new(data),
            width,
            height,
            timestamp: SystemTime::now(),
            monotonic: Instant::now(),
            frame_number,
            stream_id,
        }
    }

    /// Expected byte length for BGR24 at the declared dimensions
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    /// Validate pixel buffer length against the declared dimensions
    pub fn validate_len(&self) -> bool {
        self.data.len() == self.expected_len()
    }

    /// Frame age relative to now
    pub fn age(&self) -> Duration {
        self.monotonic.elapsed()
    }

    /// Check if the frame is older than the given duration
    pub fn is_older_than(&self, duration: Duration) -> bool {
        self.age() > duration
    }

    /// Encode this frame as a JPEG at the given quality.
    ///
    /// Pixel data is converted BGR to RGB before encoding.
    pub fn to_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        encode_bgr_jpeg(&self.data, self.width, self.height, quality)
    }
}

/// Convert a BGR24 buffer to RGB24
pub fn bgr_to_rgb(data: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(data.len());
    for px in data.chunks_exact(3) {
        rgb.push(px[2]);
        rgb.push(px[1]);
        rgb.push(px[0]);
    }
    rgb
}

/// Encode a BGR24 buffer as JPEG
pub fn encode_bgr_jpeg(data: &[u8], width: u32, height: u32, quality: u8) -> Result<Vec<u8>> {
    if data.len() != width as usize * height as usize * 3 {
        return Err(ClipError::Thumbnail {
            details: format!(
                "buffer length {} does not match {}x{} BGR frame",
                data.len(),
                width,
                height
            ),
        }
        .into());
    }

    let rgb = bgr_to_rgb(data);
    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
    encoder
        .encode(&rgb, width, height, image::ColorType::Rgb8)
        .map_err(|e| ClipError::Thumbnail {
            details: e.to_string(),
        })?;
    Ok(out)
}

/// Render a flat dark placeholder JPEG, used by the MJPEG endpoint while a
/// stream has not yet produced frames.
pub fn placeholder_jpeg(width: u32, height: u32) -> Result<Vec<u8>> {
    let data = vec![0x20u8; width as usize * height as usize * 3];
    encode_bgr_jpeg(&data, width, height, 75)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_packet(frame_number: u64) -> FramePacket {
        FramePacket::new(vec![0u8; 64 * 48 * 3], 64, 48, frame_number, "s1".into())
    }

    #[test]
    fn test_packet_len_validation() {
        let packet = test_packet(1);
        assert_eq!(packet.expected_len(), 64 * 48 * 3);
        assert!(packet.validate_len());

        let bad = FramePacket::new(vec![0u8; 10], 64, 48, 2, "s1".into());
        assert!(!bad.validate_len());
    }

    #[test]
    fn test_bgr_to_rgb_swaps_channels() {
        let bgr = vec![1u8, 2, 3, 10, 20, 30];
        let rgb = bgr_to_rgb(&bgr);
        assert_eq!(rgb, vec![3, 2, 1, 30, 20, 10]);
    }

    #[test]
    fn test_jpeg_encode_produces_jpeg_magic() {
        let packet = test_packet(1);
        let jpeg = packet.to_jpeg(85).unwrap();
        assert!(jpeg.len() > 4);
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_jpeg_encode_rejects_bad_buffer() {
        assert!(encode_bgr_jpeg(&[0u8; 5], 64, 48, 85).is_err());
    }

    #[test]
    fn test_placeholder_is_valid_jpeg() {
        let jpeg = placeholder_jpeg(320, 180).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_frame_age() {
        let packet = test_packet(1);
        std::thread::sleep(Duration::from_millis(20));
        assert!(packet.is_older_than(Duration::from_millis(10)));
        assert!(!packet.is_older_than(Duration::from_secs(5)));
    }
}
