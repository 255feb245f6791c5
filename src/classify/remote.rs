use crate::classify::{Classification, FrameClassifier};
use crate::error::ClassifierError;
use crate::frame::FramePacket;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Classifier that forwards frame windows to the external inference service.
///
/// The window is shipped as one octet-stream of concatenated BGR frames with
/// dimension headers; the service responds with class probabilities. A call
/// is bounded by the configured timeout; timeouts surface as
/// `ClassifierError::Timeout` so the scheduler can skip the tick.
pub struct RemoteClassifier {
    base_url: String,
    timeout: Duration,
    client: reqwest::Client,
    reachable: AtomicBool,
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    probabilities: Probabilities,
    #[serde(default)]
    camera_motion: bool,
}

#[derive(Debug, Deserialize)]
struct Probabilities {
    violence: f64,
    #[serde(rename = "nonViolence")]
    non_violence: f64,
}

impl RemoteClassifier {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ClassifierError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClassifierError::RequestFailed {
                details: e.to_string(),
            })?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            client,
            reachable: AtomicBool::new(false),
        })
    }

    /// Probe the service health endpoint once, recording reachability
    pub async fn probe(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                self.reachable.store(true, Ordering::Relaxed);
                true
            }
            Ok(resp) => {
                warn!("Inference service health check returned {}", resp.status());
                false
            }
            Err(e) => {
                warn!("Inference service unreachable: {}", e);
                false
            }
        }
    }
}

#[async_trait]
impl FrameClassifier for RemoteClassifier {
    async fn classify(&self, frames: &[FramePacket]) -> Result<Classification, ClassifierError> {
        let first = frames.first().ok_or(ClassifierError::BadWindow {
            got: 0,
            want: 16,
        })?;

        let mut body = Vec::with_capacity(frames.len() * first.data.len());
        for frame in frames {
            body.extend_from_slice(&frame.data);
        }

        let url = format!("{}/inference/predict-window", self.base_url);
        let started = Instant::now();

        let response = self
            .client
            .post(&url)
            .header("content-type", "application/octet-stream")
            .header("x-frame-count", frames.len().to_string())
            .header("x-frame-width", first.width.to_string())
            .header("x-frame-height", first.height.to_string())
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ClassifierError::Timeout {
                        timeout: self.timeout,
                    }
                } else {
                    ClassifierError::RequestFailed {
                        details: e.to_string(),
                    }
                }
            })?;

        if !response.status().is_success() {
            return Err(ClassifierError::RequestFailed {
                details: format!("inference service returned {}", response.status()),
            });
        }

        let parsed: PredictResponse =
            response
                .json()
                .await
                .map_err(|e| ClassifierError::BadResponse {
                    details: e.to_string(),
                })?;

        self.reachable.store(true, Ordering::Relaxed);
        let inference_ms = started.elapsed().as_secs_f64() * 1000.0;
        debug!(
            "Remote inference: violence={:.3} in {:.1}ms",
            parsed.probabilities.violence, inference_ms
        );

        Ok(Classification {
            violence_score: parsed.probabilities.violence,
            non_violence_score: parsed.probabilities.non_violence,
            inference_ms,
            camera_motion: parsed.camera_motion,
        })
    }

    fn is_loaded(&self) -> bool {
        self.reachable.load(Ordering::Relaxed)
    }

    fn describe(&self) -> String {
        format!("remote:{}", self.base_url)
    }
}
