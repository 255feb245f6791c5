//! Post-event participant capture.
//!
//! After an event finalizes, a handful of key frames are run through a
//! person/face detector; surviving boxes are padded, cropped, downscaled
//! and written next to the clip. The hook is optional and its failure never
//! affects the finalized event.

use crate::clip::sanitize_filename;
use crate::frame::{bgr_to_rgb, FramePacket};
use image::imageops::FilterType;
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

const IOU_THRESHOLD: f64 = 0.4;
const BOX_PADDING: f64 = 0.15;
const MAX_CROP_SIDE: u32 = 300;
const JPEG_QUALITY: u8 = 90;
const MAX_IMAGES: usize = 6;

/// Detection box in pixel coordinates with a confidence score
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub score: f64,
}

impl BoundingBox {
    pub fn area(&self) -> f64 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// External person or face detector
pub trait PersonDetector: Send + Sync {
    fn detect(&self, frame: &FramePacket) -> Vec<BoundingBox>;
}

/// Intersection-over-union of two boxes
pub fn iou(a: &BoundingBox, b: &BoundingBox) -> f64 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.area() + b.area() - intersection;
    if union <= 0.0 {
        return 0.0;
    }
    intersection / union
}

/// Greedy non-maximum suppression by descending score
pub fn non_max_suppression(mut boxes: Vec<BoundingBox>, iou_threshold: f64) -> Vec<BoundingBox> {
    boxes.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let mut kept: Vec<BoundingBox> = Vec::new();
    for candidate in boxes {
        if kept.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

/// Expand a box by `padding` on each side, clamped to the frame
pub fn expand_box(b: &BoundingBox, padding: f64, frame_w: u32, frame_h: u32) -> BoundingBox {
    let pad_x = b.width * padding;
    let pad_y = b.height * padding;
    let x = (b.x - pad_x).max(0.0);
    let y = (b.y - pad_y).max(0.0);
    let x2 = (b.x + b.width + pad_x).min(frame_w as f64);
    let y2 = (b.y + b.height + pad_y).min(frame_h as f64);

    BoundingBox {
        x,
        y,
        width: (x2 - x).max(0.0),
        height: (y2 - y).max(0.0),
        score: b.score,
    }
}

/// Sampling positions over the finalized frame list: start, quarter, third,
/// middle, two-thirds and near the end.
pub fn key_indices(len: usize) -> Vec<usize> {
    if len == 0 {
        return Vec::new();
    }
    let mut indices = vec![
        0,
        len / 4,
        len / 3,
        len / 2,
        len * 2 / 3,
        len.saturating_sub(2),
    ];
    indices.retain(|&i| i < len);
    indices.sort_unstable();
    indices.dedup();
    indices
}

/// Runs the participant-capture hook for finalized events
pub struct PersonCapture {
    detector: Arc<dyn PersonDetector>,
    clips_dir: PathBuf,
}

impl PersonCapture {
    pub fn new<P: AsRef<Path>>(detector: Arc<dyn PersonDetector>, clips_dir: P) -> Self {
        Self {
            detector,
            clips_dir: clips_dir.as_ref().to_path_buf(),
        }
    }

    /// Extract up to six participant crops from key frames.
    ///
    /// Returns the written filenames; failures are logged and skipped.
    pub fn extract(
        &self,
        frames: &[FramePacket],
        stream_id: &str,
        event_id: &str,
    ) -> Vec<String> {
        let mut written = Vec::new();

        for index in key_indices(frames.len()) {
            if written.len() >= MAX_IMAGES {
                break;
            }
            let frame = &frames[index];
            let boxes = non_max_suppression(self.detector.detect(frame), IOU_THRESHOLD);

            for b in boxes {
                if written.len() >= MAX_IMAGES {
                    break;
                }
                let expanded = expand_box(&b, BOX_PADDING, frame.width, frame.height);
                match self.write_crop(frame, &expanded, stream_id, event_id, written.len()) {
                    Ok(filename) => written.push(filename),
                    Err(e) => warn!("Person crop failed for event {}: {}", event_id, e),
                }
            }
        }

        debug!(
            "Extracted {} participant crops for event {}",
            written.len(),
            event_id
        );
        written
    }

    fn write_crop(
        &self,
        frame: &FramePacket,
        b: &BoundingBox,
        stream_id: &str,
        event_id: &str,
        index: usize,
    ) -> Result<String, String> {
        let x = b.x as u32;
        let y = b.y as u32;
        let w = (b.width as u32).max(1).min(frame.width.saturating_sub(x));
        let h = (b.height as u32).max(1).min(frame.height.saturating_sub(y));
        if w == 0 || h == 0 {
            return Err("degenerate crop".to_string());
        }

        let rgb = bgr_to_rgb(&frame.data);
        let img = RgbImage::from_raw(frame.width, frame.height, rgb)
            .ok_or_else(|| "frame buffer mismatch".to_string())?;
        let crop = image::imageops::crop_imm(&img, x, y, w, h).to_image();

        // Downscale so the longest side stays within bounds
        let longest = w.max(h);
        let crop = if longest > MAX_CROP_SIDE {
            let scale = MAX_CROP_SIDE as f64 / longest as f64;
            image::imageops::resize(
                &crop,
                ((w as f64 * scale) as u32).max(1),
                ((h as f64 * scale) as u32).max(1),
                FilterType::Triangle,
            )
        } else {
            crop
        };

        let filename = format!(
            "{}_{}_person{}.jpg",
            sanitize_filename(stream_id),
            sanitize_filename(event_id),
            index
        );
        let path = self.clips_dir.join(&filename);

        let mut out = Vec::new();
        let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
        encoder
            .encode(
                crop.as_raw(),
                crop.width(),
                crop.height(),
                image::ColorType::Rgb8,
            )
            .map_err(|e| e.to_string())?;
        std::fs::write(&path, &out).map_err(|e| e.to_string())?;

        Ok(filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bb(x: f64, y: f64, w: f64, h: f64, score: f64) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width: w,
            height: h,
            score,
        }
    }

    struct FixedDetector(Vec<BoundingBox>);

    impl PersonDetector for FixedDetector {
        fn detect(&self, _frame: &FramePacket) -> Vec<BoundingBox> {
            self.0.clone()
        }
    }

    fn frame() -> FramePacket {
        FramePacket::new(vec![128u8; 64 * 48 * 3], 64, 48, 1, "s1".into())
    }

    #[test]
    fn test_iou_overlapping_and_disjoint() {
        let a = bb(0.0, 0.0, 10.0, 10.0, 1.0);
        let same = bb(0.0, 0.0, 10.0, 10.0, 0.5);
        assert!((iou(&a, &same) - 1.0).abs() < 1e-9);

        let disjoint = bb(20.0, 20.0, 5.0, 5.0, 1.0);
        assert_eq!(iou(&a, &disjoint), 0.0);

        let half = bb(5.0, 0.0, 10.0, 10.0, 1.0);
        let expected = 50.0 / 150.0;
        assert!((iou(&a, &half) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_nms_keeps_highest_scoring() {
        let boxes = vec![
            bb(0.0, 0.0, 10.0, 10.0, 0.9),
            bb(1.0, 1.0, 10.0, 10.0, 0.8), // overlaps first, suppressed
            bb(30.0, 30.0, 10.0, 10.0, 0.7),
        ];
        let kept = non_max_suppression(boxes, 0.4);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].score, 0.9);
        assert_eq!(kept[1].score, 0.7);
    }

    #[test]
    fn test_expand_box_clamps_to_frame() {
        let b = bb(0.0, 0.0, 20.0, 20.0, 1.0);
        let expanded = expand_box(&b, 0.15, 64, 48);
        assert_eq!(expanded.x, 0.0);
        assert_eq!(expanded.y, 0.0);
        assert!((expanded.width - 23.0).abs() < 1e-9);

        let near_edge = bb(50.0, 40.0, 14.0, 8.0, 1.0);
        let expanded = expand_box(&near_edge, 0.15, 64, 48);
        assert!(expanded.x + expanded.width <= 64.0);
        assert!(expanded.y + expanded.height <= 48.0);
    }

    #[test]
    fn test_key_indices_shape() {
        assert!(key_indices(0).is_empty());
        assert_eq!(key_indices(1), vec![0]);

        let indices = key_indices(100);
        assert_eq!(indices, vec![0, 25, 33, 50, 66, 98]);
        assert!(indices.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_extract_writes_capped_crops() {
        let dir = tempfile::tempdir().unwrap();
        let detector = Arc::new(FixedDetector(vec![
            bb(2.0, 2.0, 16.0, 16.0, 0.9),
            bb(40.0, 20.0, 16.0, 16.0, 0.8),
        ]));
        let capture = PersonCapture::new(detector, dir.path());

        let frames: Vec<FramePacket> = (0..30).map(|_| frame()).collect();
        let written = capture.extract(&frames, "s1", "e1");

        assert!(!written.is_empty());
        assert!(written.len() <= 6);
        for name in &written {
            assert!(dir.path().join(name).exists());
            assert!(name.ends_with(".jpg"));
        }
    }

    #[test]
    fn test_extract_with_no_detections_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let capture = PersonCapture::new(Arc::new(FixedDetector(Vec::new())), dir.path());
        let frames: Vec<FramePacket> = (0..10).map(|_| frame()).collect();
        assert!(capture.extract(&frames, "s1", "e1").is_empty());
    }
}
