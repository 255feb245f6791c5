pub mod decoder;
#[cfg(all(target_os = "linux", feature = "ingest-gstreamer"))]
pub mod gst;
pub mod synthetic;

pub use decoder::{DecodedFrame, FrameDecoder, StreamKind};
pub use synthetic::SyntheticDecoder;

use crate::error::IngestError;
use crate::frame::FramePacket;
use crate::ring_buffer::FrameRing;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Runtime configuration for one stream's capture pipeline
#[derive(Debug, Clone)]
pub struct StreamSpec {
    pub id: String,
    pub name: String,
    pub url: String,
    pub kind: StreamKind,
    pub target_fps: u32,
    pub resize_width: u32,
    pub resize_height: u32,
    pub buffer_size: usize,
    pub read_timeout: Duration,
    pub reconnect_delay: Duration,
    /// Unbounded reconnects when absent
    pub max_reconnect_attempts: Option<u32>,
}

/// Acquisition phase of a frame source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Stopped,
    Error,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceStatus::Disconnected => "disconnected",
            SourceStatus::Connecting => "connecting",
            SourceStatus::Connected => "connected",
            SourceStatus::Reconnecting => "reconnecting",
            SourceStatus::Stopped => "stopped",
            SourceStatus::Error => "error",
        }
    }
}

/// Point-in-time snapshot of a source's acquisition state
#[derive(Debug, Clone, Serialize)]
pub struct IngestStatus {
    pub phase: SourceStatus,
    pub frame_count: u64,
    pub buffer_len: usize,
    pub last_frame_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub reconnects: u32,
    pub decode_errors: u64,
}

/// Invoked on every source status transition
pub type StatusCallback = Arc<dyn Fn(SourceStatus, Option<String>) + Send + Sync>;
/// Invoked for every frame pushed into the ring
pub type FrameCallback = Arc<dyn Fn(&FramePacket) + Send + Sync>;
/// Produces a decoder for a spec; injected so tests can supply scripted sources
pub type DecoderFactory =
    Arc<dyn Fn(&StreamSpec) -> Result<Box<dyn FrameDecoder>, IngestError> + Send + Sync>;

/// Decoder selection for production streams.
///
/// `synthetic://` URLs always resolve to the test-pattern source; everything
/// else requires the GStreamer backend feature.
pub fn default_decoder_factory() -> DecoderFactory {
    Arc::new(|spec: &StreamSpec| {
        if spec.url.starts_with("synthetic://") {
            return Ok(Box::new(SyntheticDecoder::new(
                spec.resize_width,
                spec.resize_height,
                spec.target_fps,
            )));
        }

        #[cfg(all(target_os = "linux", feature = "ingest-gstreamer"))]
        {
            Ok(Box::new(gst::GstDecoder::new(
                &spec.url,
                spec.kind,
                spec.resize_width,
                spec.resize_height,
            )))
        }

        #[cfg(not(all(target_os = "linux", feature = "ingest-gstreamer")))]
        {
            Err(IngestError::NotAvailable)
        }
    })
}

/// Per-stream frame acquisition: runs the decoder on a blocking thread,
/// paces frames to `target_fps`, fills the ring buffer and reconnects on
/// failure.
///
/// An ingestion is single-use: `start` spawns the capture worker once and
/// `stop` cancels it permanently. The stream manager constructs a fresh
/// ingestion for every run.
pub struct StreamIngestion {
    spec: StreamSpec,
    ring: Arc<FrameRing>,
    decoder_factory: DecoderFactory,
    status: RwLock<SourceStatus>,
    last_error: RwLock<Option<String>>,
    last_frame_at: RwLock<Option<DateTime<Utc>>>,
    frame_count: AtomicU64,
    reconnects: AtomicU32,
    decode_errors: AtomicU64,
    started: AtomicBool,
    cancel: CancellationToken,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
    on_status_change: RwLock<Option<StatusCallback>>,
    on_frame: RwLock<Option<FrameCallback>>,
    /// Self-handle for the capture thread
    weak: std::sync::Weak<StreamIngestion>,
}

impl StreamIngestion {
    pub fn new(spec: StreamSpec, decoder_factory: DecoderFactory) -> Arc<Self> {
        let ring = Arc::new(FrameRing::new(spec.buffer_size));
        Arc::new_cyclic(|weak| Self {
            spec,
            ring,
            decoder_factory,
            status: RwLock::new(SourceStatus::Disconnected),
            last_error: RwLock::new(None),
            last_frame_at: RwLock::new(None),
            frame_count: AtomicU64::new(0),
            reconnects: AtomicU32::new(0),
            decode_errors: AtomicU64::new(0),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            worker: Mutex::new(None),
            on_status_change: RwLock::new(None),
            on_frame: RwLock::new(None),
            weak: weak.clone(),
        })
    }

    pub fn spec(&self) -> &StreamSpec {
        &self.spec
    }

    pub fn ring(&self) -> Arc<FrameRing> {
        Arc::clone(&self.ring)
    }

    /// Register the status-change hook. Must be set before `start`.
    pub fn set_on_status_change(&self, callback: StatusCallback) {
        *self.on_status_change.write() = Some(callback);
    }

    /// Register the per-frame hook. Must be set before `start`.
    pub fn set_on_frame(&self, callback: FrameCallback) {
        *self.on_frame.write() = Some(callback);
    }

    /// Begin acquisition. Idempotent; a second call is a no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Stream {} capture already started", self.spec.name);
            return;
        }

        let this = match self.weak.upgrade() {
            Some(this) => this,
            None => return,
        };
        match std::thread::Builder::new()
            .name(format!("capture-{}", self.spec.id))
            .spawn(move || this.capture_loop())
        {
            Ok(handle) => *self.worker.lock() = Some(handle),
            Err(e) => {
                error!("Failed to spawn capture thread for {}: {}", self.spec.name, e);
                self.set_status(SourceStatus::Error, Some(e.to_string()));
            }
        }
    }

    /// Cease acquisition. The capture worker is expected to unblock within
    /// the decoder read timeout; after 3 s it is abandoned and the decoder
    /// torn down by the thread whenever it returns.
    pub fn stop(&self) {
        info!("Stopping capture for stream {}", self.spec.name);
        self.cancel.cancel();

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let deadline = Instant::now() + Duration::from_secs(3);
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(25));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!(
                    "Capture worker for {} did not exit within 3s; abandoning thread",
                    self.spec.name
                );
            }
        }

        // A terminal ERROR (reconnect budget exhausted) stays visible
        if *self.status.read() != SourceStatus::Error {
            self.set_status(SourceStatus::Stopped, None);
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.status.read() == SourceStatus::Connected
    }

    pub fn is_stopped(&self) -> bool {
        matches!(
            *self.status.read(),
            SourceStatus::Stopped | SourceStatus::Error
        )
    }

    pub fn get_latest(&self) -> Option<FramePacket> {
        self.ring.latest()
    }

    pub fn get_last_consecutive(&self, k: usize) -> Vec<FramePacket> {
        self.ring.last_consecutive(k)
    }

    pub fn get_last_window(&self, window: Duration) -> Vec<FramePacket> {
        self.ring.last_window(window)
    }

    pub fn get_uniform_sampled(&self, k: usize) -> Vec<FramePacket> {
        self.ring.uniform_sampled(k)
    }

    pub fn status(&self) -> IngestStatus {
        IngestStatus {
            phase: *self.status.read(),
            frame_count: self.frame_count.load(Ordering::Relaxed),
            buffer_len: self.ring.len(),
            last_frame_at: *self.last_frame_at.read(),
            last_error: self.last_error.read().clone(),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }

    fn set_status(&self, status: SourceStatus, message: Option<String>) {
        {
            let mut current = self.status.write();
            if *current == status {
                return;
            }
            *current = status;
        }
        if let Some(msg) = &message {
            *self.last_error.write() = Some(msg.clone());
        }
        debug!(
            "Stream {} status -> {} {}",
            self.spec.name,
            status.as_str(),
            message.as_deref().unwrap_or("")
        );
        let callback = self.on_status_change.read().clone();
        if let Some(cb) = callback {
            cb(status, message);
        }
    }

    /// Sleep in short slices so cancellation is honored promptly
    fn interruptible_sleep(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while Instant::now() < deadline && !self.cancel.is_cancelled() {
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    fn capture_loop(self: Arc<Self>) {
        info!(
            "Starting capture for {} ({}, {})",
            self.spec.name, self.spec.url, self.spec.kind
        );

        let frame_interval = Duration::from_secs_f64(1.0 / self.spec.target_fps.max(1) as f64);
        let mut attempts: u32 = 0;

        'outer: while !self.cancel.is_cancelled() {
            self.set_status(SourceStatus::Connecting, None);

            let mut decoder = match (self.decoder_factory)(&self.spec) {
                Ok(d) => d,
                Err(e) => {
                    error!("Decoder creation failed for {}: {}", self.spec.name, e);
                    self.set_status(SourceStatus::Error, Some(e.to_string()));
                    break;
                }
            };

            if let Err(e) = decoder.open() {
                warn!("Open failed for {}: {}", self.spec.name, e);
                if !self.schedule_reconnect(&mut attempts, &e.to_string()) {
                    break;
                }
                continue;
            }

            attempts = 0;
            *self.last_error.write() = None;
            self.set_status(SourceStatus::Connected, None);

            // Next slot a frame is allowed to occupy; earlier frames are dropped
            let mut next_slot = Instant::now();

            loop {
                if self.cancel.is_cancelled() {
                    decoder.close();
                    break 'outer;
                }

                match decoder.read(self.spec.read_timeout) {
                    Ok(frame) => {
                        let now = Instant::now();
                        if now < next_slot {
                            continue;
                        }
                        next_slot = now + frame_interval;
                        self.deliver(frame);
                    }
                    Err(IngestError::FrameTimeout { timeout }) => {
                        warn!(
                            "No frame from {} within {:?}, treating as disconnect",
                            self.spec.name, timeout
                        );
                        decoder.close();
                        if !self.schedule_reconnect(&mut attempts, "frame timeout") {
                            break 'outer;
                        }
                        continue 'outer;
                    }
                    Err(IngestError::DecodeRead { details }) => {
                        // Dropped silently, counted
                        self.decode_errors.fetch_add(1, Ordering::Relaxed);
                        debug!("Decode error on {}: {}", self.spec.name, details);
                    }
                    Err(e) => {
                        warn!("Stream {} disconnected: {}", self.spec.name, e);
                        decoder.close();
                        if !self.schedule_reconnect(&mut attempts, &e.to_string()) {
                            break 'outer;
                        }
                        continue 'outer;
                    }
                }
            }
        }

        if *self.status.read() != SourceStatus::Error {
            self.set_status(SourceStatus::Stopped, None);
        }
        info!("Capture stopped for {}", self.spec.name);
    }

    fn deliver(&self, frame: DecodedFrame) {
        let frame_number = self.frame_count.fetch_add(1, Ordering::Relaxed) + 1;
        let packet = FramePacket::new(
            frame.data,
            frame.width,
            frame.height,
            frame_number,
            self.spec.id.clone(),
        );
        *self.last_frame_at.write() = Some(Utc::now());

        let callback = self.on_frame.read().clone();
        if let Some(cb) = callback {
            cb(&packet);
        }
        self.ring.push(packet);
    }

    /// Returns false when the reconnect budget is exhausted
    fn schedule_reconnect(&self, attempts: &mut u32, reason: &str) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }

        *attempts += 1;
        self.reconnects.fetch_add(1, Ordering::Relaxed);

        if let Some(max) = self.spec.max_reconnect_attempts {
            if *attempts > max {
                error!(
                    "Reconnect budget exhausted for {} after {} attempts",
                    self.spec.name, max
                );
                self.set_status(
                    SourceStatus::Error,
                    Some(format!("reconnect budget exhausted: {}", reason)),
                );
                return false;
            }
        }

        self.set_status(SourceStatus::Reconnecting, Some(reason.to_string()));
        info!(
            "Reconnecting {} in {:?} (attempt {})",
            self.spec.name, self.spec.reconnect_delay, attempts
        );
        self.interruptible_sleep(self.spec.reconnect_delay);
        !self.cancel.is_cancelled()
    }
}
