use crate::db::Severity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Typed messages fanned out to every WebSocket subscriber.
///
/// The `type` tag on the wire matches the frontend contract: inference ticks,
/// source status changes, stream lifecycle and event lifecycle messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    InferenceScore {
        stream_id: String,
        /// Smoothed score; the raw model output rides alongside
        violence_score: f64,
        non_violence_score: f64,
        is_violent: bool,
        raw_score: f64,
        timestamp: DateTime<Utc>,
    },
    StreamStatus {
        stream_id: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    StreamStarted {
        stream_id: String,
        name: String,
    },
    StreamStopped {
        stream_id: String,
        name: String,
    },
    EventStart {
        event_id: String,
        stream_id: String,
        stream_name: String,
        start_time: DateTime<Utc>,
        confidence: f64,
        severity: Severity,
    },
    ViolenceAlert {
        #[serde(skip_serializing_if = "Option::is_none")]
        event_id: Option<String>,
        stream_id: String,
        confidence: f64,
        severity: Severity,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        clip_path: Option<String>,
    },
    EventEnd {
        event_id: String,
        stream_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        clip_path: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        thumbnail_path: Option<String>,
        duration: f64,
        max_confidence: f64,
        avg_confidence: f64,
        severity: Severity,
        person_images: Vec<String>,
    },
}

impl WsMessage {
    /// Wire tag for logging and filtering
    pub fn kind(&self) -> &'static str {
        match self {
            WsMessage::InferenceScore { .. } => "inference_score",
            WsMessage::StreamStatus { .. } => "stream_status",
            WsMessage::StreamStarted { .. } => "stream_started",
            WsMessage::StreamStopped { .. } => "stream_stopped",
            WsMessage::EventStart { .. } => "event_start",
            WsMessage::ViolenceAlert { .. } => "violence_alert",
            WsMessage::EventEnd { .. } => "event_end",
        }
    }
}

/// Fan-out of typed JSON messages to WebSocket subscribers.
///
/// A bounded broadcast channel decouples publishers from consumers: a slow
/// subscriber lags and drops messages instead of blocking the detector or
/// the other subscribers.
pub struct BroadcastHub {
    sender: broadcast::Sender<WsMessage>,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WsMessage> {
        self.sender.subscribe()
    }

    /// Publish to all subscribers. Returns the receiver count; zero
    /// subscribers is not an error.
    pub fn publish(&self, message: WsMessage) -> usize {
        match &message {
            WsMessage::EventStart {
                stream_name,
                confidence,
                ..
            } => {
                warn!(
                    "Violence event started on {} (confidence {:.1}%)",
                    stream_name,
                    confidence * 100.0
                );
            }
            WsMessage::ViolenceAlert { stream_id, confidence, .. } => {
                warn!(
                    "Violence alert on stream {} (confidence {:.1}%)",
                    stream_id,
                    confidence * 100.0
                );
            }
            WsMessage::EventEnd { event_id, duration, .. } => {
                info!("Event {} ended after {:.1}s", event_id, duration);
            }
            WsMessage::StreamStatus { stream_id, status, .. } => {
                debug!("Stream {} status -> {}", stream_id, status);
            }
            _ => {}
        }

        self.sender.send(message).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Clone for BroadcastHub {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}
