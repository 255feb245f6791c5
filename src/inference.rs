use crate::classify::FrameClassifier;
use crate::db::{EventRepository, InferenceLogEntry};
use crate::detector::EventDetector;
use crate::hub::{BroadcastHub, WsMessage};
use crate::ingest::StreamIngestion;
use crate::smoothing::ScoreSmoother;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One inference result over a window of consecutive frames
#[derive(Debug, Clone, Serialize)]
pub struct InferenceScore {
    pub stream_id: String,
    /// Raw model output for this window
    pub raw_score: f64,
    /// Moving average over the last N raw scores
    pub smoothed_score: f64,
    pub non_violence_score: f64,
    pub consecutive_high: u32,
    pub inference_ms: f64,
    pub frame_count: usize,
    pub window_start_ts: DateTime<Utc>,
    pub window_end_ts: DateTime<Utc>,
    pub window_end_frame: u64,
    pub timestamp: DateTime<Utc>,
    pub camera_motion: bool,
}

/// Scheduler tuning for one stream
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    /// Consecutive frames per classifier window
    pub window: usize,
    /// Effective violence threshold; `is_violent` on the wire uses the
    /// smoothed score against this
    pub threshold: f64,
}

/// Drives the classifier at a fixed cadence over the newest frame window.
///
/// One scheduler task per stream guarantees scores reach the detector in
/// strict `window_end_ts` order. Ticks are skipped while the source is not
/// connected, while fewer than `window` frames are buffered, and when the
/// newest frame was already classified.
pub struct InferenceScheduler {
    config: SchedulerConfig,
    ingestion: Arc<StreamIngestion>,
    classifier: Arc<dyn FrameClassifier>,
    detector: Arc<EventDetector>,
    hub: BroadcastHub,
    events: Arc<dyn EventRepository>,
    smoother: Mutex<ScoreSmoother>,
    last_score: RwLock<Option<InferenceScore>>,
    last_processed_frame: AtomicU64,
    ticks: AtomicU64,
    skipped_ticks: AtomicU64,
    cancel: CancellationToken,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
    /// Self-handle for the cadence task
    weak: std::sync::Weak<InferenceScheduler>,
}

impl InferenceScheduler {
    pub fn new(
        config: SchedulerConfig,
        ingestion: Arc<StreamIngestion>,
        classifier: Arc<dyn FrameClassifier>,
        detector: Arc<EventDetector>,
        hub: BroadcastHub,
        events: Arc<dyn EventRepository>,
        smoothing_window: usize,
        alert_threshold: f64,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config,
            ingestion,
            classifier,
            detector,
            hub,
            events,
            smoother: Mutex::new(ScoreSmoother::new(smoothing_window, alert_threshold)),
            last_score: RwLock::new(None),
            last_processed_frame: AtomicU64::new(0),
            ticks: AtomicU64::new(0),
            skipped_ticks: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            worker: Mutex::new(None),
            weak: weak.clone(),
        })
    }

    /// Spawn the cadence loop
    pub async fn start(&self) {
        let this = match self.weak.upgrade() {
            Some(this) => this,
            None => return,
        };
        let handle = tokio::spawn(async move {
            this.run().await;
        });
        *self.worker.lock().await = Some(handle);
    }

    /// Stop within one cadence tick; an in-flight classifier call may
    /// complete but its result is discarded.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
        self.smoother.lock().await.reset();
    }

    /// Latest emitted score, for the prediction endpoint
    pub fn last_score(&self) -> Option<InferenceScore> {
        self.last_score.read().clone()
    }

    pub fn tick_counts(&self) -> (u64, u64) {
        (
            self.ticks.load(Ordering::Relaxed),
            self.skipped_ticks.load(Ordering::Relaxed),
        )
    }

    async fn run(self: Arc<Self>) {
        info!(
            "Inference scheduler started for {} ({:?} cadence, {}-frame window)",
            self.ingestion.spec().name,
            self.config.interval,
            self.config.window
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            self.ticks.fetch_add(1, Ordering::Relaxed);

            if !self.ingestion.is_connected() {
                self.skipped_ticks.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let frames = self.ingestion.get_last_consecutive(self.config.window);
            if frames.len() < self.config.window {
                self.skipped_ticks.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let newest = frames.last().expect("window not empty").frame_number;
            if newest == self.last_processed_frame.load(Ordering::Relaxed) {
                self.skipped_ticks.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let result = self.classifier.classify(&frames).await;
            if self.cancel.is_cancelled() {
                break;
            }

            let classification = match result {
                Ok(c) => c,
                Err(e) => {
                    self.skipped_ticks.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "Inference skipped on {}: {}",
                        self.ingestion.spec().name,
                        e
                    );
                    continue;
                }
            };

            self.last_processed_frame.store(newest, Ordering::Relaxed);

            let mut raw = classification.violence_score;
            if !raw.is_finite() || !(0.0..=1.0).contains(&raw) {
                warn!(
                    "Classifier returned out-of-range score {:?} on {}, treating as 0",
                    raw,
                    self.ingestion.spec().name
                );
                raw = 0.0;
            }

            let smoothed = self.smoother.lock().await.push(raw);

            let first = frames.first().expect("window not empty");
            let last = frames.last().expect("window not empty");
            let score = InferenceScore {
                stream_id: self.ingestion.spec().id.clone(),
                raw_score: raw,
                smoothed_score: smoothed.smoothed,
                non_violence_score: 1.0 - raw,
                consecutive_high: smoothed.consecutive_high,
                inference_ms: classification.inference_ms,
                frame_count: frames.len(),
                window_start_ts: first.timestamp.into(),
                window_end_ts: last.timestamp.into(),
                window_end_frame: last.frame_number,
                timestamp: Utc::now(),
                camera_motion: classification.camera_motion,
            };

            *self.last_score.write() = Some(score.clone());

            self.hub.publish(WsMessage::InferenceScore {
                stream_id: score.stream_id.clone(),
                violence_score: score.smoothed_score,
                non_violence_score: 1.0 - score.smoothed_score,
                is_violent: score.smoothed_score >= self.config.threshold,
                raw_score: score.raw_score,
                timestamp: score.timestamp,
            });

            // Best-effort analytics row; failures never reach the detector
            let _ = self
                .events
                .log_inference(InferenceLogEntry {
                    stream_id: score.stream_id.clone(),
                    timestamp: score.timestamp,
                    violence_score: score.raw_score,
                    non_violence_score: score.non_violence_score,
                    inference_ms: score.inference_ms,
                    frame_number: score.window_end_frame,
                    window_start: score.window_start_ts,
                    window_end: score.window_end_ts,
                })
                .await;

            self.detector.on_score(&score).await;
        }

        info!(
            "Inference scheduler stopped for {}",
            self.ingestion.spec().name
        );
    }
}
