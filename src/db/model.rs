use crate::ingest::StreamKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Review status of a detection event. PENDING until a reviewer acts;
/// every other status is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Pending,
    Confirmed,
    Dismissed,
    AutoDismissed,
    ActionExecuted,
    NoActionRequired,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "PENDING",
            EventStatus::Confirmed => "CONFIRMED",
            EventStatus::Dismissed => "DISMISSED",
            EventStatus::AutoDismissed => "AUTO_DISMISSED",
            EventStatus::ActionExecuted => "ACTION_EXECUTED",
            EventStatus::NoActionRequired => "NO_ACTION_REQUIRED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, EventStatus::Pending)
    }
}

impl std::str::FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(EventStatus::Pending),
            "CONFIRMED" => Ok(EventStatus::Confirmed),
            "DISMISSED" => Ok(EventStatus::Dismissed),
            "AUTO_DISMISSED" => Ok(EventStatus::AutoDismissed),
            "ACTION_EXECUTED" => Ok(EventStatus::ActionExecuted),
            "NO_ACTION_REQUIRED" => Ok(EventStatus::NoActionRequired),
            other => Err(format!("unknown event status: {}", other)),
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity label derived from an event's peak confidence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Boundaries: CRITICAL >= 0.95, HIGH >= 0.85, MEDIUM >= 0.75, else LOW
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= 0.95 {
            Severity::Critical
        } else if confidence >= 0.85 {
            Severity::High
        } else if confidence >= 0.75 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOW" => Ok(Severity::Low),
            "MEDIUM" => Ok(Severity::Medium),
            "HIGH" => Ok(Severity::High),
            "CRITICAL" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {}", other)),
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted stream configuration and last known status
#[derive(Debug, Clone, Serialize)]
pub struct StreamRecord {
    pub id: String,
    pub name: String,
    pub url: String,
    pub stream_type: StreamKind,
    pub location: Option<String>,
    pub is_active: bool,
    pub status: String,
    pub last_frame_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub target_fps: Option<u32>,
    pub resize_width: Option<u32>,
    pub resize_height: Option<u32>,
    pub custom_threshold: Option<f64>,
    pub custom_window_seconds: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields accepted when creating a stream
#[derive(Debug, Clone)]
pub struct NewStream {
    pub name: String,
    pub url: String,
    pub stream_type: StreamKind,
    pub location: Option<String>,
    pub custom_threshold: Option<f64>,
    pub custom_window_seconds: Option<u32>,
}

/// Persisted violence detection event
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub id: String,
    pub stream_id: String,
    pub stream_name: String,
    pub start_ts: DateTime<Utc>,
    pub end_ts: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub max_confidence: f64,
    pub avg_confidence: f64,
    pub min_confidence: f64,
    pub frame_count: u32,
    pub severity: Severity,
    pub status: EventStatus,
    pub clip_path: Option<String>,
    pub clip_duration: Option<f64>,
    pub thumbnail_path: Option<String>,
    pub person_images: Vec<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub reviewed_by: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields written when an event opens
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub id: String,
    pub stream_id: String,
    pub stream_name: String,
    pub start_ts: DateTime<Utc>,
    pub opening_score: f64,
    pub frame_count: u32,
}

/// Fields written atomically when an event finalizes
#[derive(Debug, Clone)]
pub struct EventFinalization {
    pub end_ts: DateTime<Utc>,
    pub scores: Vec<f64>,
    pub frame_count: u32,
    pub clip_path: Option<String>,
    pub clip_duration: Option<f64>,
    pub thumbnail_path: Option<String>,
    pub person_images: Vec<String>,
}

/// Filters for event listing
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub status: Option<EventStatus>,
    pub stream_id: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub start_after: Option<DateTime<Utc>>,
    pub start_before: Option<DateTime<Utc>>,
}

/// Aggregate statistics over a trailing window of days
#[derive(Debug, Clone, Serialize)]
pub struct EventStatistics {
    pub days: u32,
    pub total: u64,
    pub by_status: std::collections::HashMap<String, u64>,
    pub by_severity: std::collections::HashMap<String, u64>,
    pub by_stream: std::collections::HashMap<String, u64>,
}

/// One row of the best-effort inference log
#[derive(Debug, Clone)]
pub struct InferenceLogEntry {
    pub stream_id: String,
    pub timestamp: DateTime<Utc>,
    pub violence_score: f64,
    pub non_violence_score: f64,
    pub inference_ms: f64,
    pub frame_number: u64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}
