use crate::frame::FramePacket;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::trace;

/// Bounded FIFO buffer holding the most recent frames of one stream.
///
/// The capture worker writes, the inference scheduler and MJPEG preview
/// workers read. All reads are point-in-time snapshots: they clone the
/// packet structs (pixel data is behind an `Arc`, so no pixels are copied)
/// and never block the writer beyond the duration of the copy. When full,
/// the oldest frame is evicted before insertion; the decoder is never
/// backpressured.
pub struct FrameRing {
    frames: Mutex<VecDeque<FramePacket>>,
    capacity: usize,
    stats: FrameRingStats,
}

/// Counters for ring performance monitoring
#[derive(Debug, Default)]
pub struct FrameRingStats {
    /// Total frames pushed
    pub frames_pushed: AtomicU64,
    /// Frames evicted because the ring was full
    pub frames_evicted: AtomicU64,
}

/// Snapshot of ring statistics
#[derive(Debug, Clone)]
pub struct FrameRingStatsSnapshot {
    pub frames_pushed: u64,
    pub frames_evicted: u64,
    pub len: usize,
    pub capacity: usize,
}

impl FrameRing {
    /// Create a ring with a fixed capacity.
    ///
    /// # Panics
    /// Panics when `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be greater than 0");
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            stats: FrameRingStats::default(),
        }
    }

    /// Push a frame, evicting the oldest when full
    pub fn push(&self, packet: FramePacket) {
        let mut frames = self.frames.lock();
        if frames.len() == self.capacity {
            frames.pop_front();
            self.stats.frames_evicted.fetch_add(1, Ordering::Relaxed);
        }
        trace!(
            frame = packet.frame_number,
            stream = %packet.stream_id,
            "ring push"
        );
        frames.push_back(packet);
        self.stats.frames_pushed.fetch_add(1, Ordering::Relaxed);
    }

    /// Most recently pushed frame, if any
    pub fn latest(&self) -> Option<FramePacket> {
        self.frames.lock().back().cloned()
    }

    /// The newest `k` frames in capture order, contiguous by frame number.
    ///
    /// This is the canonical classifier input: no sampling, no skipping.
    /// Returns fewer than `k` frames while the ring is still filling.
    pub fn last_consecutive(&self, k: usize) -> Vec<FramePacket> {
        let frames = self.frames.lock();
        let skip = frames.len().saturating_sub(k);
        frames.iter().skip(skip).cloned().collect()
    }

    /// Frames captured within the trailing `window`, oldest first
    pub fn last_window(&self, window: Duration) -> Vec<FramePacket> {
        let frames = self.frames.lock();
        frames
            .iter()
            .filter(|f| f.age() <= window)
            .cloned()
            .collect()
    }

    /// `k` frames at evenly spaced indices over the whole ring, oldest first
    pub fn uniform_sampled(&self, k: usize) -> Vec<FramePacket> {
        let frames = self.frames.lock();
        if k == 0 || frames.is_empty() {
            return Vec::new();
        }
        if frames.len() <= k {
            return frames.iter().cloned().collect();
        }

        let step = (frames.len() - 1) as f64 / (k - 1).max(1) as f64;
        (0..k)
            .map(|i| {
                let idx = (i as f64 * step).round() as usize;
                frames[idx.min(frames.len() - 1)].clone()
            })
            .collect()
    }

    /// Frame number of the newest element, 0 when empty
    pub fn last_frame_number(&self) -> u64 {
        self.frames.lock().back().map(|f| f.frame_number).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop all buffered frames; counters are preserved
    pub fn clear(&self) {
        self.frames.lock().clear();
    }

    pub fn stats(&self) -> FrameRingStatsSnapshot {
        FrameRingStatsSnapshot {
            frames_pushed: self.stats.frames_pushed.load(Ordering::Relaxed),
            frames_evicted: self.stats.frames_evicted.load(Ordering::Relaxed),
            len: self.len(),
            capacity: self.capacity,
        }
    }
}
