use std::time::Duration;
use thiserror::Error;

/// Main error type for the vigil system
#[derive(Error, Debug)]
pub enum VigilError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Classifier error: {0}")]
    Classifier(#[from] ClassifierError),

    #[error("Detector error: {0}")]
    Detector(#[from] DetectorError),

    #[error("Clip error: {0}")]
    Clip(#[from] ClipError),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Stream manager error: {0}")]
    Manager(#[from] ManagerError),

    #[error("API server error: {0}")]
    Api(#[from] ApiError),

    #[error("System error: {message}")]
    System { message: String },

    #[error("Graceful shutdown requested")]
    Shutdown,
}

/// Stream ingestion error types
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Failed to open source {url}: {details}")]
    SourceOpen { url: String, details: String },

    #[error("Decoder read failed: {details}")]
    DecodeRead { details: String },

    #[error("Frame timeout after {timeout:?}")]
    FrameTimeout { timeout: Duration },

    #[error("Source disconnected")]
    Disconnected,

    #[error("Reconnect budget exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Unsupported stream type: {stream_type}")]
    UnsupportedType { stream_type: String },

    #[error("Decoder backend not available (feature disabled)")]
    NotAvailable,
}

/// Classifier error types
#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("Model not loaded")]
    NotLoaded,

    #[error("Inference request failed: {details}")]
    RequestFailed { details: String },

    #[error("Inference timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Window has {got} frames, classifier requires {want}")]
    BadWindow { got: usize, want: usize },

    #[error("Malformed classifier response: {details}")]
    BadResponse { details: String },
}

/// Event detector error types
#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Event already active for stream {stream_id}")]
    EventAlreadyActive { stream_id: String },

    #[error("No active event to finalize on stream {stream_id}")]
    NoActiveEvent { stream_id: String },
}

/// Clip recording error types
#[derive(Error, Debug)]
pub enum ClipError {
    #[error("No frames to encode")]
    EmptyInput,

    #[error("Failed to create clips directory {path}: {source}")]
    DirectoryCreation {
        path: String,
        source: std::io::Error,
    },

    #[error("Video encoding failed: {details}")]
    Encoding { details: String },

    #[error("Thumbnail write failed: {details}")]
    Thumbnail { details: String },

    #[error("Video encoding not available (feature disabled)")]
    EncoderNotAvailable,
}

/// Repository error types
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Database open failed for {path}: {details}")]
    Open { path: String, details: String },

    #[error("Query failed: {details}")]
    Query { details: String },

    #[error("Stream not found: {id}")]
    StreamNotFound { id: String },

    #[error("Event not found: {id}")]
    EventNotFound { id: String },

    #[error("Event {id} already reviewed (status {status})")]
    AlreadyReviewed { id: String, status: String },

    #[error("Migration failed: {details}")]
    Migration { details: String },
}

impl From<rusqlite::Error> for RepositoryError {
    fn from(e: rusqlite::Error) -> Self {
        RepositoryError::Query {
            details: e.to_string(),
        }
    }
}

/// Stream manager error types
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("Stream not found: {id}")]
    StreamNotFound { id: String },

    #[error("Stream {id} is already running")]
    AlreadyRunning { id: String },

    #[error("Stream {id} is not running")]
    NotRunning { id: String },

    #[error("Invalid stream config: {details}")]
    InvalidConfig { details: String },
}

/// HTTP/WebSocket API error types
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Failed to bind to {address}: {source}")]
    BindFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("Server error: {details}")]
    Server { details: String },
}

impl VigilError {
    /// Create a system error with a message
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    /// Check if this error is recoverable without restarting the process
    pub fn is_recoverable(&self) -> bool {
        match self {
            VigilError::Ingest(IngestError::Disconnected) => true,
            VigilError::Ingest(IngestError::DecodeRead { .. }) => true,
            VigilError::Ingest(IngestError::FrameTimeout { .. }) => true,
            VigilError::Ingest(IngestError::SourceOpen { .. }) => true,
            VigilError::Classifier(ClassifierError::Timeout { .. }) => true,
            VigilError::Classifier(ClassifierError::RequestFailed { .. }) => true,
            VigilError::Repository(RepositoryError::Query { .. }) => true,
            VigilError::Io(_) => true,
            VigilError::Config(_) => false,
            VigilError::Shutdown => false,
            _ => false,
        }
    }

    /// Get the component name associated with this error
    pub fn component_name(&self) -> &'static str {
        match self {
            VigilError::Ingest(_) => "ingest",
            VigilError::Classifier(_) => "classifier",
            VigilError::Detector(_) => "detector",
            VigilError::Clip(_) => "clip",
            VigilError::Repository(_) => "repository",
            VigilError::Manager(_) => "manager",
            VigilError::Api(_) => "api",
            VigilError::Config(_) => "config",
            _ => "system",
        }
    }
}

/// Convenience type alias for Results
pub type Result<T> = std::result::Result<T, VigilError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_display_formatting() {
        let err = VigilError::Ingest(IngestError::SourceOpen {
            url: "rtsp://cam1/stream".to_string(),
            details: "connection refused".to_string(),
        });
        assert_eq!(
            err.to_string(),
            "Ingest error: Failed to open source rtsp://cam1/stream: connection refused"
        );

        let err = VigilError::Classifier(ClassifierError::BadWindow { got: 3, want: 16 });
        assert_eq!(
            err.to_string(),
            "Classifier error: Window has 3 frames, classifier requires 16"
        );

        let err = VigilError::system("boom");
        assert_eq!(err.to_string(), "System error: boom");
    }

    #[test]
    fn test_recoverable_error_classification() {
        assert!(VigilError::Ingest(IngestError::Disconnected).is_recoverable());
        assert!(VigilError::Classifier(ClassifierError::Timeout {
            timeout: Duration::from_secs(30)
        })
        .is_recoverable());
        assert!(VigilError::Repository(RepositoryError::Query {
            details: "locked".to_string()
        })
        .is_recoverable());

        assert!(!VigilError::Shutdown.is_recoverable());
        assert!(!VigilError::system("fatal").is_recoverable());
        assert!(!VigilError::Clip(ClipError::EmptyInput).is_recoverable());
    }

    #[test]
    fn test_component_name_extraction() {
        assert_eq!(
            VigilError::Ingest(IngestError::Disconnected).component_name(),
            "ingest"
        );
        assert_eq!(
            VigilError::Repository(RepositoryError::EventNotFound {
                id: "x".to_string()
            })
            .component_name(),
            "repository"
        );
        assert_eq!(VigilError::system("x").component_name(), "system");
    }

    #[test]
    fn test_error_source_chains() {
        use std::error::Error;

        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err = VigilError::Io(io);
        assert!(err.source().is_some());
        assert_eq!(err.source().unwrap().to_string(), "missing");
    }
}
