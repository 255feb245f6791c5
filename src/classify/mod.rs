pub mod remote;

pub use remote::RemoteClassifier;

use crate::error::ClassifierError;
use crate::frame::FramePacket;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Output of one classifier call over a frame window
#[derive(Debug, Clone, Copy)]
pub struct Classification {
    /// Probability of violence in [0, 1]
    pub violence_score: f64,
    /// Complement probability
    pub non_violence_score: f64,
    /// Wall time of the inference call in milliseconds
    pub inference_ms: f64,
    /// Hint that the window is dominated by global camera motion.
    /// Only honored when the motion veto flag is enabled.
    pub camera_motion: bool,
}

impl Classification {
    pub fn from_score(violence_score: f64, inference_ms: f64) -> Self {
        Self {
            violence_score,
            non_violence_score: 1.0 - violence_score,
            inference_ms,
            camera_motion: false,
        }
    }
}

/// Stateless frame-window classifier.
///
/// Implementations may run in-process or call out to a remote inference
/// service; the scheduler only sees this trait.
#[async_trait]
pub trait FrameClassifier: Send + Sync {
    /// Classify a window of consecutive frames.
    async fn classify(&self, frames: &[FramePacket]) -> Result<Classification, ClassifierError>;

    /// Whether a model is available behind this classifier
    fn is_loaded(&self) -> bool;

    /// Human-readable backend description for /model/status
    fn describe(&self) -> String;
}

/// Classifier that replays a fixed score sequence, then holds the last value.
///
/// Test double for detector and scheduler scenarios; also understands NaN
/// entries to exercise the out-of-range handling path.
pub struct ScriptedClassifier {
    scores: Vec<f64>,
    cursor: AtomicUsize,
    calls: AtomicUsize,
    motion_flags: Mutex<Vec<bool>>,
}

impl ScriptedClassifier {
    pub fn new(scores: Vec<f64>) -> Self {
        assert!(!scores.is_empty(), "script must contain at least one score");
        Self {
            scores,
            cursor: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            motion_flags: Mutex::new(Vec::new()),
        }
    }

    pub fn constant(score: f64) -> Self {
        Self::new(vec![score])
    }

    /// Per-call camera-motion flags, aligned with the score script
    pub fn with_motion_flags(self, flags: Vec<bool>) -> Self {
        *self.motion_flags.lock() = flags;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl FrameClassifier for ScriptedClassifier {
    async fn classify(&self, frames: &[FramePacket]) -> Result<Classification, ClassifierError> {
        if frames.is_empty() {
            return Err(ClassifierError::BadWindow { got: 0, want: 16 });
        }

        let idx = self.cursor.fetch_add(1, Ordering::Relaxed);
        self.calls.fetch_add(1, Ordering::Relaxed);
        let score = *self
            .scores
            .get(idx)
            .unwrap_or_else(|| self.scores.last().unwrap());
        let motion = self
            .motion_flags
            .lock()
            .get(idx)
            .copied()
            .unwrap_or(false);

        Ok(Classification {
            violence_score: score,
            non_violence_score: 1.0 - score,
            inference_ms: 1.0,
            camera_motion: motion,
        })
    }

    fn is_loaded(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

/// Placeholder used when no model could be loaded. The API stays up,
/// /model/status reports not-loaded and every tick is skipped.
pub struct UnloadedClassifier;

#[async_trait]
impl FrameClassifier for UnloadedClassifier {
    async fn classify(&self, _frames: &[FramePacket]) -> Result<Classification, ClassifierError> {
        Err(ClassifierError::NotLoaded)
    }

    fn is_loaded(&self) -> bool {
        false
    }

    fn describe(&self) -> String {
        "unloaded".to_string()
    }
}
