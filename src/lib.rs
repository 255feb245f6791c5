// Core building blocks
pub mod config;
pub mod error;
pub mod frame;
pub mod ring_buffer;

// Pipeline stages
pub mod classify;
pub mod detector;
pub mod inference;
pub mod ingest;
pub mod smoothing;

// Artifacts
pub mod clip;

// Persistence
pub mod db;

// Coordination and surface
pub mod api;
pub mod hub;
pub mod manager;

// Re-export common types at the crate root
pub use classify::{Classification, FrameClassifier, RemoteClassifier, ScriptedClassifier};
pub use clip::{ClipArtifacts, ClipRecorder, PersonCapture, PersonDetector};
pub use config::VigilConfig;
pub use db::{
    Database, EventRepository, EventStatus, Severity, SqliteEventRepository,
    SqliteStreamRepository, StreamRepository,
};
pub use detector::{DetectorConfig, DetectorPhase, EventDetector};
pub use error::{Result, VigilError};
pub use frame::FramePacket;
pub use hub::{BroadcastHub, WsMessage};
pub use inference::{InferenceScheduler, InferenceScore};
pub use ingest::{FrameDecoder, SourceStatus, StreamIngestion, StreamKind, StreamSpec};
pub use manager::{AddStreamRequest, StreamManager};
pub use ring_buffer::FrameRing;
pub use smoothing::ScoreSmoother;
