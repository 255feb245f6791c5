use crate::clip::{ClipRecorder, PersonCapture};
use crate::db::{EventFinalization, EventRepository, NewEvent, Severity};
use crate::frame::FramePacket;
use crate::hub::{BroadcastHub, WsMessage};
use crate::inference::InferenceScore;
use crate::ingest::StreamIngestion;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Detector tuning for one stream
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub stream_id: String,
    pub stream_name: String,
    /// Score at or above which a window counts as violent (ties count)
    pub threshold: f64,
    /// High-confidence alerting threshold
    pub alert_threshold: f64,
    /// Consecutive violent windows required to open an event
    pub min_consecutive: u32,
    /// Consecutive sub-hysteresis windows required before closing begins
    pub end_consecutive: u32,
    pub cooldown: Duration,
    pub clip_before: Duration,
    pub clip_after: Duration,
    /// Zero out scores the classifier flags as camera motion
    pub motion_veto: bool,
}

impl DetectorConfig {
    /// Hysteresis: an open event only starts closing below this
    pub fn end_threshold(&self) -> f64 {
        self.threshold * 0.8
    }
}

/// Detector phase for one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DetectorPhase {
    Idle,
    Triggered,
    Active,
    Ending,
    Cooldown,
}

#[derive(Debug)]
struct DetectorState {
    phase: DetectorPhase,
    consecutive_violent: u32,
    consecutive_calm: u32,
    current_event_id: Option<String>,
    event_start: Option<DateTime<Utc>>,
    scores: Vec<f64>,
    peak_score: f64,
    cooldown_until: Option<Instant>,
    last_alert_at: Option<Instant>,
    pre_frames: Vec<FramePacket>,
    event_frames: Vec<FramePacket>,
    finalize_cancel: Option<CancellationToken>,
}

impl DetectorState {
    fn new() -> Self {
        Self {
            phase: DetectorPhase::Idle,
            consecutive_violent: 0,
            consecutive_calm: 0,
            current_event_id: None,
            event_start: None,
            scores: Vec::new(),
            peak_score: 0.0,
            cooldown_until: None,
            last_alert_at: None,
            pre_frames: Vec::new(),
            event_frames: Vec::new(),
            finalize_cancel: None,
        }
    }
}

/// Status snapshot exposed by the API
#[derive(Debug, Clone, Serialize)]
pub struct DetectorStatus {
    pub phase: DetectorPhase,
    pub consecutive_violent: u32,
    pub consecutive_calm: u32,
    pub current_event_id: Option<String>,
    pub event_score_count: usize,
    pub peak_score: f64,
    pub in_cooldown: bool,
}

/// Everything carried out of the lock when an event closes
struct FinalizeJob {
    event_id: String,
    start_ts: DateTime<Utc>,
    scores: Vec<f64>,
    frames: Vec<FramePacket>,
}

/// Per-stream violence-event state machine.
///
/// Consumes raw scores in strict window order from the inference scheduler.
/// IDLE/TRIGGERED handle opening confirmation, ACTIVE/ENDING carry an open
/// event with hysteresis, COOLDOWN is the post-event refractory period.
/// State is serialized behind one async mutex shared by the inference tick
/// and the delayed finalize timer; exactly one event per stream can be open.
pub struct EventDetector {
    config: DetectorConfig,
    ingestion: Arc<StreamIngestion>,
    events: Arc<dyn EventRepository>,
    hub: BroadcastHub,
    recorder: Arc<ClipRecorder>,
    person_capture: Option<Arc<PersonCapture>>,
    state: Mutex<DetectorState>,
    /// Self-handle for the finalize timer task
    weak: std::sync::Weak<EventDetector>,
}

impl EventDetector {
    pub fn new(
        config: DetectorConfig,
        ingestion: Arc<StreamIngestion>,
        events: Arc<dyn EventRepository>,
        hub: BroadcastHub,
        recorder: Arc<ClipRecorder>,
        person_capture: Option<Arc<PersonCapture>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config,
            ingestion,
            events,
            hub,
            recorder,
            person_capture,
            state: Mutex::new(DetectorState::new()),
            weak: weak.clone(),
        })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub async fn status(&self) -> DetectorStatus {
        let state = self.state.lock().await;
        DetectorStatus {
            phase: state.phase,
            consecutive_violent: state.consecutive_violent,
            consecutive_calm: state.consecutive_calm,
            current_event_id: state.current_event_id.clone(),
            event_score_count: state.scores.len(),
            peak_score: state.peak_score,
            in_cooldown: state.phase == DetectorPhase::Cooldown,
        }
    }

    /// Process one inference tick. Scores arrive in strict window order.
    pub async fn on_score(&self, score: &InferenceScore) {
        let mut raw = score.raw_score;
        if self.config.motion_veto && score.camera_motion && raw > 0.0 {
            debug!(
                "Motion veto zeroed score {:.2} on {}",
                raw, self.config.stream_name
            );
            raw = 0.0;
        }

        let mut state = self.state.lock().await;

        // Cooldown expiry is evaluated on the tick
        if state.phase == DetectorPhase::Cooldown {
            let expired = state
                .cooldown_until
                .map(|until| Instant::now() >= until)
                .unwrap_or(true);
            if expired {
                state.phase = DetectorPhase::Idle;
                state.cooldown_until = None;
            }
        }

        // Rolling captures around the state machine
        match state.phase {
            DetectorPhase::Idle | DetectorPhase::Triggered => {
                state.pre_frames = self.ingestion.get_last_window(self.config.clip_before);
            }
            DetectorPhase::Active | DetectorPhase::Ending => {
                state
                    .event_frames
                    .extend(self.ingestion.get_last_consecutive(1));
            }
            DetectorPhase::Cooldown => {}
        }

        let violent = raw >= self.config.threshold;

        // High-confidence alerting outside the event lifecycle
        if raw >= self.config.alert_threshold {
            let alert_open = state
                .last_alert_at
                .map(|at| at.elapsed() >= self.config.cooldown)
                .unwrap_or(true);
            if alert_open {
                state.last_alert_at = Some(Instant::now());
                self.hub.publish(WsMessage::ViolenceAlert {
                    event_id: state.current_event_id.clone(),
                    stream_id: self.config.stream_id.clone(),
                    confidence: raw,
                    severity: Severity::from_confidence(raw),
                    message: format!("Violence detected on {}", self.config.stream_name),
                    clip_path: None,
                });
            }
        }

        match state.phase {
            DetectorPhase::Idle => {
                if violent {
                    state.consecutive_violent = 1;
                    if state.consecutive_violent >= self.config.min_consecutive {
                        self.open_event(&mut state, score, raw).await;
                    } else {
                        state.phase = DetectorPhase::Triggered;
                    }
                } else {
                    state.consecutive_violent = 0;
                }
            }
            DetectorPhase::Triggered => {
                if violent {
                    state.consecutive_violent += 1;
                    if state.consecutive_violent >= self.config.min_consecutive {
                        self.open_event(&mut state, score, raw).await;
                    }
                } else {
                    state.phase = DetectorPhase::Idle;
                    state.consecutive_violent = 0;
                }
            }
            DetectorPhase::Active => {
                state.scores.push(raw);
                state.peak_score = state.peak_score.max(raw);

                if raw < self.config.end_threshold() {
                    state.consecutive_calm += 1;
                    if state.consecutive_calm >= self.config.end_consecutive {
                        self.schedule_finalize(&mut state);
                    }
                } else {
                    state.consecutive_calm = 0;
                }
            }
            DetectorPhase::Ending => {
                state.scores.push(raw);
                state.peak_score = state.peak_score.max(raw);

                if raw >= self.config.threshold {
                    // Violence resumed before the post-roll elapsed
                    if let Some(cancel) = state.finalize_cancel.take() {
                        cancel.cancel();
                    }
                    state.phase = DetectorPhase::Active;
                    state.consecutive_calm = 0;
                    debug!(
                        "Violence resumed on {}, finalize cancelled",
                        self.config.stream_name
                    );
                }
            }
            DetectorPhase::Cooldown => {}
        }
    }

    async fn open_event(&self, state: &mut DetectorState, score: &InferenceScore, raw: f64) {
        let event_id = Uuid::new_v4().to_string();
        let start_ts = score.window_end_ts;

        state.phase = DetectorPhase::Active;
        state.current_event_id = Some(event_id.clone());
        state.event_start = Some(start_ts);
        state.scores = vec![raw];
        state.peak_score = raw;
        state.consecutive_calm = 0;
        state.event_frames = self.ingestion.get_last_consecutive(1);

        info!(
            "Violence event {} started on {} (score {:.2}, {} pre-roll frames)",
            event_id,
            self.config.stream_name,
            raw,
            state.pre_frames.len()
        );

        // In-memory state is authoritative; a repository outage is logged
        // and the event is still tracked and finalized later.
        if let Err(e) = self
            .events
            .create(NewEvent {
                id: event_id.clone(),
                stream_id: self.config.stream_id.clone(),
                stream_name: self.config.stream_name.clone(),
                start_ts,
                opening_score: raw,
                frame_count: score.frame_count as u32,
            })
            .await
        {
            error!("Failed to persist event {}: {}", event_id, e);
        }

        self.hub.publish(WsMessage::EventStart {
            event_id: event_id.clone(),
            stream_id: self.config.stream_id.clone(),
            stream_name: self.config.stream_name.clone(),
            start_time: start_ts,
            confidence: raw,
            severity: Severity::from_confidence(raw),
        });
        state.last_alert_at = Some(Instant::now());
        self.hub.publish(WsMessage::ViolenceAlert {
            event_id: Some(event_id),
            stream_id: self.config.stream_id.clone(),
            confidence: raw,
            severity: Severity::from_confidence(raw),
            message: format!("Violence detected on {}", self.config.stream_name),
            clip_path: None,
        });
    }

    /// Enter ENDING and arm the post-roll timer
    fn schedule_finalize(&self, state: &mut DetectorState) {
        state.phase = DetectorPhase::Ending;

        let cancel = CancellationToken::new();
        state.finalize_cancel = Some(cancel.clone());

        let detector = match self.weak.upgrade() {
            Some(detector) => detector,
            None => return,
        };
        let wait = self.config.clip_after;
        info!(
            "Violence stopped on {}, finalizing in {:?}",
            self.config.stream_name, wait
        );

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(wait) => {
                    detector.finalize(false).await;
                }
            }
        });
    }

    /// Close the open event. `forced` finalizes from ACTIVE as well
    /// (stream stopping); the timer path only completes from ENDING.
    pub async fn finalize(&self, forced: bool) {
        let job = {
            let mut state = self.state.lock().await;
            let eligible = match state.phase {
                DetectorPhase::Ending => true,
                DetectorPhase::Active => forced,
                _ => false,
            };
            if !eligible {
                return;
            }

            if let Some(cancel) = state.finalize_cancel.take() {
                cancel.cancel();
            }

            let event_id = match state.current_event_id.take() {
                Some(id) => id,
                None => return,
            };

            let post_frames = self.ingestion.get_last_window(self.config.clip_after);
            let pre_frames = std::mem::take(&mut state.pre_frames);
            let event_frames = std::mem::take(&mut state.event_frames);

            let mut merged: BTreeMap<u64, FramePacket> = BTreeMap::new();
            for frame in pre_frames
                .into_iter()
                .chain(event_frames)
                .chain(post_frames)
            {
                merged.entry(frame.frame_number).or_insert(frame);
            }

            let job = FinalizeJob {
                event_id,
                start_ts: state.event_start.take().unwrap_or_else(Utc::now),
                scores: std::mem::take(&mut state.scores),
                frames: merged.into_values().collect(),
            };

            // The event is closed in memory before the slow artifact work;
            // COOLDOWN guards against immediate re-open and double finalize.
            state.phase = DetectorPhase::Cooldown;
            state.cooldown_until = Some(Instant::now() + self.config.cooldown);
            state.consecutive_violent = 0;
            state.consecutive_calm = 0;
            state.peak_score = 0.0;

            job
        };

        self.write_artifacts(job).await;
    }

    async fn write_artifacts(&self, job: FinalizeJob) {
        let end_ts = Utc::now();
        let frame_count = job.frames.len() as u32;

        let (clip_path, clip_duration, thumbnail_path) = if job.frames.is_empty() {
            warn!("Event {} has no frames; skipping clip", job.event_id);
            (None, None, None)
        } else {
            match self
                .recorder
                .record(&job.frames, &self.config.stream_id, &job.event_id)
                .await
            {
                Ok(artifacts) => (
                    artifacts
                        .mp4_path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string()),
                    Some(artifacts.duration_seconds),
                    artifacts
                        .thumbnail_path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string()),
                ),
                Err(e) => {
                    warn!("Clip encode failed for event {}: {}", job.event_id, e);
                    (None, None, None)
                }
            }
        };

        let person_images = match (&self.person_capture, job.frames.is_empty()) {
            (Some(capture), false) => {
                let capture = Arc::clone(capture);
                let frames = job.frames.clone();
                let stream_id = self.config.stream_id.clone();
                let event_id = job.event_id.clone();
                tokio::task::spawn_blocking(move || {
                    capture.extract(&frames, &stream_id, &event_id)
                })
                .await
                .unwrap_or_default()
            }
            _ => Vec::new(),
        };

        let max_conf = job.scores.iter().cloned().fold(0.0f64, f64::max);
        let avg_conf = if job.scores.is_empty() {
            0.0
        } else {
            job.scores.iter().sum::<f64>() / job.scores.len() as f64
        };
        let duration = (end_ts - job.start_ts).num_milliseconds().max(0) as f64 / 1000.0;

        if let Err(e) = self
            .events
            .finalize(
                &job.event_id,
                EventFinalization {
                    end_ts,
                    scores: job.scores,
                    frame_count,
                    clip_path: clip_path.clone(),
                    clip_duration,
                    thumbnail_path: thumbnail_path.clone(),
                    person_images: person_images.clone(),
                },
            )
            .await
        {
            error!("Failed to finalize event {}: {}", job.event_id, e);
        }

        let severity = Severity::from_confidence(max_conf);
        self.hub.publish(WsMessage::EventEnd {
            event_id: job.event_id.clone(),
            stream_id: self.config.stream_id.clone(),
            clip_path: clip_path.clone(),
            thumbnail_path,
            duration,
            max_confidence: max_conf,
            avg_confidence: avg_conf,
            severity,
            person_images,
        });
        self.hub.publish(WsMessage::ViolenceAlert {
            event_id: Some(job.event_id.clone()),
            stream_id: self.config.stream_id.clone(),
            confidence: max_conf,
            severity,
            message: format!(
                "Violence event completed on {} ({:.0}s)",
                self.config.stream_name, duration
            ),
            clip_path,
        });

        info!(
            "Event {} finalized: {:.1}s, max {:.2}, {} frames",
            job.event_id, duration, max_conf, frame_count
        );
    }

    /// Forced end when the owning stream stops while an event is open
    pub async fn on_stream_stop(&self) {
        self.finalize(true).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, EventFilter, EventStatus, SqliteEventRepository};
    use crate::ingest::{DecoderFactory, StreamKind, StreamSpec, SyntheticDecoder};

    fn spec() -> StreamSpec {
        StreamSpec {
            id: "s1".to_string(),
            name: "cam".to_string(),
            url: "synthetic://test".to_string(),
            kind: StreamKind::Rtsp,
            target_fps: 30,
            resize_width: 16,
            resize_height: 12,
            buffer_size: 256,
            read_timeout: Duration::from_secs(2),
            reconnect_delay: Duration::from_millis(50),
            max_reconnect_attempts: None,
        }
    }

    fn factory() -> DecoderFactory {
        Arc::new(|spec: &StreamSpec| {
            Ok(Box::new(SyntheticDecoder::new(
                spec.resize_width,
                spec.resize_height,
                spec.target_fps,
            )) as Box<dyn crate::ingest::FrameDecoder>)
        })
    }

    fn config() -> DetectorConfig {
        DetectorConfig {
            stream_id: "s1".to_string(),
            stream_name: "cam".to_string(),
            threshold: 0.5,
            alert_threshold: 0.9,
            min_consecutive: 2,
            end_consecutive: 3,
            cooldown: Duration::from_secs(5),
            clip_before: Duration::from_secs(5),
            clip_after: Duration::from_secs(10),
            motion_veto: false,
        }
    }

    struct Harness {
        detector: Arc<EventDetector>,
        events: Arc<SqliteEventRepository>,
        ingestion: Arc<StreamIngestion>,
        hub: BroadcastHub,
        next_frame: u64,
        _dir: tempfile::TempDir,
    }

    async fn harness(config: DetectorConfig) -> Harness {
        let db = Database::open_in_memory().await.unwrap();
        let events = Arc::new(SqliteEventRepository::new(db));
        let ingestion = StreamIngestion::new(spec(), factory());
        let hub = BroadcastHub::new(64);
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(ClipRecorder::new(dir.path().join("clips"), 30).unwrap());

        let detector = EventDetector::new(
            config,
            Arc::clone(&ingestion),
            events.clone() as Arc<dyn EventRepository>,
            hub.clone(),
            recorder,
            None,
        );

        Harness {
            detector,
            events,
            ingestion,
            hub,
            next_frame: 0,
            _dir: dir,
        }
    }

    impl Harness {
        /// Push a frame and feed one score, as the scheduler would
        async fn tick(&mut self, raw: f64) {
            self.next_frame += 1;
            self.ingestion.ring().push(FramePacket::new(
                vec![0u8; 16 * 12 * 3],
                16,
                12,
                self.next_frame,
                "s1".into(),
            ));

            let now = Utc::now();
            let score = InferenceScore {
                stream_id: "s1".to_string(),
                raw_score: raw,
                smoothed_score: raw,
                non_violence_score: 1.0 - raw,
                consecutive_high: 0,
                inference_ms: 1.0,
                frame_count: 16,
                window_start_ts: now,
                window_end_ts: now,
                window_end_frame: self.next_frame,
                timestamp: now,
                camera_motion: false,
            };
            self.detector.on_score(&score).await;
        }

        async fn phase(&self) -> DetectorPhase {
            self.detector.status().await.phase
        }

        async fn event_count(&self) -> u64 {
            self.events.count(&EventFilter::default()).await.unwrap()
        }

        /// Wait for the background finalize work to land in the repository
        async fn wait_finalized(&self, event_index: usize) -> crate::db::EventRecord {
            for _ in 0..100 {
                let events = self.events.list(EventFilter::default()).await.unwrap();
                if let Some(event) = events.get(event_index) {
                    if event.end_ts.is_some() {
                        return event.clone();
                    }
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            panic!("event {} never finalized", event_index);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_steady_non_violence_creates_nothing() {
        let mut h = harness(config()).await;
        for _ in 0..50 {
            h.tick(0.1).await;
        }
        assert_eq!(h.phase().await, DetectorPhase::Idle);
        assert_eq!(h.event_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flicker_rejected_by_min_consecutive() {
        let mut h = harness(config()).await;

        h.tick(0.9).await;
        assert_eq!(h.phase().await, DetectorPhase::Triggered);

        h.tick(0.1).await;
        assert_eq!(h.phase().await, DetectorPhase::Idle);

        for _ in 0..10 {
            h.tick(0.1).await;
        }
        assert_eq!(h.event_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_confirmation_opens_event() {
        let mut h = harness(config()).await;

        h.tick(0.8).await;
        assert_eq!(h.phase().await, DetectorPhase::Triggered);
        assert_eq!(h.event_count().await, 0);

        h.tick(0.8).await;
        assert_eq!(h.phase().await, DetectorPhase::Active);
        assert_eq!(h.event_count().await, 1);

        let status = h.detector.status().await;
        assert!(status.current_event_id.is_some());
        assert_eq!(status.event_score_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_tie_counts_as_violent() {
        let mut h = harness(config()).await;
        h.tick(0.5).await;
        h.tick(0.5).await;
        assert_eq!(h.phase().await, DetectorPhase::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_consecutive_one_opens_immediately() {
        let mut cfg = config();
        cfg.min_consecutive = 1;
        let mut h = harness(cfg).await;

        h.tick(0.6).await;
        assert_eq!(h.phase().await, DetectorPhase::Active);
        assert_eq!(h.event_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hysteresis_boundary_keeps_event_open() {
        let mut h = harness(config()).await;
        h.tick(0.9).await;
        h.tick(0.9).await;
        assert_eq!(h.phase().await, DetectorPhase::Active);

        // end_threshold = 0.4; exactly at it is not ending
        for _ in 0..10 {
            h.tick(0.4).await;
        }
        assert_eq!(h.phase().await, DetectorPhase::Active);

        // below it, ENDING after end_consecutive windows
        h.tick(0.39).await;
        h.tick(0.39).await;
        assert_eq!(h.phase().await, DetectorPhase::Active);
        h.tick(0.39).await;
        assert_eq!(h.phase().await, DetectorPhase::Ending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_event_lifecycle_finalizes_once() {
        let mut h = harness(config()).await;
        let mut rx = h.hub.subscribe();

        h.tick(0.92).await;
        h.tick(0.95).await;
        h.tick(0.88).await;
        assert_eq!(h.phase().await, DetectorPhase::Active);

        for _ in 0..3 {
            h.tick(0.1).await;
        }
        assert_eq!(h.phase().await, DetectorPhase::Ending);

        // Post-roll timer fires under paused time
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(h.phase().await, DetectorPhase::Cooldown);
        assert_eq!(h.event_count().await, 1);

        let event = h.wait_finalized(0).await;
        assert!(event.duration_seconds.is_some());
        assert_eq!(event.status, EventStatus::Pending);
        // scores: 0.95 opening, 0.88, then 3 x 0.1
        assert!((event.max_confidence - 0.95).abs() < 1e-9);
        assert!((event.min_confidence - 0.1).abs() < 1e-9);
        let expected_avg = (0.95 + 0.88 + 0.3) / 5.0;
        assert!((event.avg_confidence - expected_avg).abs() < 1e-9);
        assert_eq!(event.severity, crate::db::Severity::Critical);

        // Causal order on the wire: event_start before event_end
        let mut kinds = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            kinds.push(msg.kind());
        }
        let start_idx = kinds.iter().position(|k| *k == "event_start").unwrap();
        let end_idx = kinds.iter().position(|k| *k == "event_end").unwrap();
        assert!(start_idx < end_idx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_during_ending_cancels_finalize() {
        let mut h = harness(config()).await;

        h.tick(0.9).await;
        h.tick(0.9).await;
        for _ in 0..3 {
            h.tick(0.2).await;
        }
        assert_eq!(h.phase().await, DetectorPhase::Ending);

        // Violence resumes before the post-roll elapses
        tokio::time::sleep(Duration::from_secs(4)).await;
        h.tick(0.9).await;
        assert_eq!(h.phase().await, DetectorPhase::Active);

        // The original timer must not fire
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(h.phase().await, DetectorPhase::Active);
        assert_eq!(h.event_count().await, 1);

        // Now let it end for real
        for _ in 0..3 {
            h.tick(0.1).await;
        }
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(h.event_count().await, 1);
        h.wait_finalized(0).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_blocks_reopen_until_elapsed() {
        let mut h = harness(config()).await;

        // First event
        h.tick(0.9).await;
        h.tick(0.9).await;
        for _ in 0..3 {
            h.tick(0.1).await;
        }
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(h.phase().await, DetectorPhase::Cooldown);
        assert_eq!(h.event_count().await, 1);

        // Second burst inside the cooldown creates nothing
        h.tick(0.95).await;
        h.tick(0.95).await;
        h.tick(0.95).await;
        assert_eq!(h.event_count().await, 1);

        // After the cooldown, a third burst opens a second event
        tokio::time::sleep(Duration::from_secs(6)).await;
        h.tick(0.95).await;
        h.tick(0.95).await;
        assert_eq!(h.event_count().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_end_on_stream_stop() {
        let mut h = harness(config()).await;

        h.tick(0.9).await;
        h.tick(0.9).await;
        assert_eq!(h.phase().await, DetectorPhase::Active);

        h.detector.on_stream_stop().await;
        assert_eq!(h.phase().await, DetectorPhase::Cooldown);

        let events = h.events.list(EventFilter::default()).await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].end_ts.is_some());

        // Second forced end is a no-op
        h.detector.on_stream_stop().await;
        assert_eq!(h.event_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_motion_veto_zeroes_flagged_scores() {
        let mut cfg = config();
        cfg.motion_veto = true;
        let h = harness(cfg).await;

        let now = Utc::now();
        let score = InferenceScore {
            stream_id: "s1".to_string(),
            raw_score: 0.99,
            smoothed_score: 0.99,
            non_violence_score: 0.01,
            consecutive_high: 1,
            inference_ms: 1.0,
            frame_count: 16,
            window_start_ts: now,
            window_end_ts: now,
            window_end_frame: 1,
            timestamp: now,
            camera_motion: true,
        };
        h.detector.on_score(&score).await;
        h.detector.on_score(&score).await;
        h.detector.on_score(&score).await;

        assert_eq!(h.phase().await, DetectorPhase::Idle);
        assert_eq!(h.event_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_alert_emitted_with_cooldown_outside_events() {
        let cfg = config();
        let mut h = harness(cfg).await;
        let mut rx = h.hub.subscribe();

        // Single high spike: alert fires but no event (flicker)
        h.tick(0.95).await;
        h.tick(0.1).await;

        let mut alerts = 0;
        while let Ok(msg) = rx.try_recv() {
            if msg.kind() == "violence_alert" {
                alerts += 1;
            }
        }
        assert_eq!(alerts, 1);
        assert_eq!(h.event_count().await, 0);

        // A second spike inside the alert cooldown is suppressed
        h.tick(0.95).await;
        h.tick(0.1).await;
        let mut alerts = 0;
        while let Ok(msg) = rx.try_recv() {
            if msg.kind() == "violence_alert" {
                alerts += 1;
            }
        }
        assert_eq!(alerts, 0);
    }
}
