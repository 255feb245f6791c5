use config::{Config, ConfigError, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct VigilConfig {
    pub server: ServerConfig,
    pub classifier: ClassifierConfig,
    pub stream: StreamDefaults,
    pub detection: DetectionConfig,
    pub storage: StorageConfig,
    pub log: LogConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    /// IP address to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Enable debug behavior (verbose logging, SQL echo)
    #[serde(default = "default_debug")]
    pub debug: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ClassifierConfig {
    /// Base URL of the remote inference service
    #[serde(default = "default_ml_service_url")]
    pub ml_service_url: String,

    /// Timeout for a single classify call in seconds
    #[serde(default = "default_ml_service_timeout")]
    pub ml_service_timeout_seconds: u64,

    /// Optional local model path; reported by /model/status
    pub model_path: Option<String>,
}

/// Per-stream defaults; individual streams may override threshold and window
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StreamDefaults {
    /// Ring buffer capacity in frames
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Sliding window length in seconds (informational, window is frame-based)
    #[serde(default = "default_sliding_window_seconds")]
    pub sliding_window_seconds: u32,

    /// Number of consecutive frames per classifier window
    #[serde(default = "default_frame_sample_rate")]
    pub frame_sample_rate: usize,

    /// Inference cadence in milliseconds
    #[serde(default = "default_inference_interval_ms")]
    pub inference_interval_ms: u64,

    /// Target capture frame rate
    #[serde(default = "default_target_fps")]
    pub target_fps: u32,

    /// Width frames are resized to before buffering
    #[serde(default = "default_resize_width")]
    pub resize_width: u32,

    /// Height frames are resized to before buffering
    #[serde(default = "default_resize_height")]
    pub resize_height: u32,

    /// No frame within this window is treated as a disconnect
    #[serde(default = "default_read_timeout_seconds")]
    pub read_timeout_seconds: u64,

    /// Delay before a reconnect attempt
    #[serde(default = "default_reconnect_delay_seconds")]
    pub reconnect_delay_seconds: u64,

    /// Reconnect attempt budget; unbounded when absent
    pub max_reconnect_attempts: Option<u32>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DetectionConfig {
    /// Score at or above which a window counts as violent
    #[serde(default = "default_violence_threshold")]
    pub violence_threshold: f64,

    /// High-confidence threshold for alerts and the smoother's counter
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: f64,

    /// Consecutive violent windows required to open an event
    #[serde(default = "default_min_consecutive")]
    pub min_consecutive: u32,

    /// Consecutive sub-hysteresis windows required to begin closing an event
    #[serde(default = "default_end_consecutive")]
    pub end_consecutive: u32,

    /// Refractory period after an event finalizes
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,

    /// Pre-roll captured before an event opens
    #[serde(default = "default_clip_before_seconds")]
    pub clip_before_seconds: u64,

    /// Post-roll captured after violence ends
    #[serde(default = "default_clip_after_seconds")]
    pub clip_after_seconds: u64,

    /// Raw scores averaged by the smoother
    #[serde(default = "default_smoothing_window")]
    pub smoothing_window: usize,

    /// Zero out scores flagged with camera motion by the classifier.
    /// Off by default; some models false-positive heavily under global motion.
    #[serde(default = "default_motion_veto")]
    pub motion_veto: bool,
}

impl DetectionConfig {
    /// Hysteresis threshold required to keep an event open
    pub fn end_threshold(&self) -> f64 {
        self.violence_threshold * 0.8
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    /// Directory for clips, thumbnails and person crops
    #[serde(default = "default_clips_dir")]
    pub clips_dir: String,

    /// SQLite database location; accepts `sqlite://<path>` or a bare path
    #[serde(default = "default_database_url")]
    pub database_url: String,
}

impl StorageConfig {
    /// Filesystem path extracted from `database_url`
    pub fn database_path(&self) -> String {
        self.database_url
            .strip_prefix("sqlite://")
            .or_else(|| self.database_url.strip_prefix("sqlite:"))
            .unwrap_or(&self.database_url)
            .to_string()
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LogConfig {
    /// Log level filter (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Optional log file; stderr only when absent
    pub file: Option<String>,
}

/// Recognized environment overrides, mapped onto config keys.
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("HOST", "server.host"),
    ("PORT", "server.port"),
    ("DEBUG", "server.debug"),
    ("ML_SERVICE_URL", "classifier.ml_service_url"),
    ("ML_SERVICE_TIMEOUT", "classifier.ml_service_timeout_seconds"),
    ("MODEL_PATH", "classifier.model_path"),
    ("FRAME_BUFFER_SIZE", "stream.buffer_size"),
    ("SLIDING_WINDOW_SECONDS", "stream.sliding_window_seconds"),
    ("FRAME_SAMPLE_RATE", "stream.frame_sample_rate"),
    ("INFERENCE_INTERVAL_MS", "stream.inference_interval_ms"),
    ("TARGET_FPS", "stream.target_fps"),
    ("VIOLENCE_THRESHOLD", "detection.violence_threshold"),
    ("VIOLENCE_ALERT_THRESHOLD", "detection.alert_threshold"),
    ("MIN_CONSECUTIVE_FRAMES", "detection.min_consecutive"),
    ("ALERT_COOLDOWN_SECONDS", "detection.cooldown_seconds"),
    ("CLIP_DURATION_BEFORE", "detection.clip_before_seconds"),
    ("CLIP_DURATION_AFTER", "detection.clip_after_seconds"),
    ("CLIPS_DIR", "storage.clips_dir"),
    ("DATABASE_URL", "storage.database_url"),
    ("LOG_LEVEL", "log.level"),
    ("LOG_FILE", "log.file"),
];

impl VigilConfig {
    /// Load configuration from the default file location plus environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("vigil.toml")
    }

    /// Load configuration from a specific file path, then apply env overrides
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let mut builder = Config::builder()
            .add_source(Config::try_from(&VigilConfig::default())?)
            .add_source(File::with_name(&path_str).required(false));

        for (env_name, key) in ENV_OVERRIDES {
            builder = builder.set_override_option(*key, std::env::var(env_name).ok())?;
        }

        let config: VigilConfig = builder.build()?.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stream.target_fps == 0 {
            return Err(ConfigError::Message(
                "Target fps must be greater than 0".to_string(),
            ));
        }

        if self.stream.buffer_size == 0 {
            return Err(ConfigError::Message(
                "Frame buffer size must be greater than 0".to_string(),
            ));
        }

        if self.stream.frame_sample_rate == 0 {
            return Err(ConfigError::Message(
                "Frame sample rate must be greater than 0".to_string(),
            ));
        }

        if self.stream.resize_width == 0 || self.stream.resize_height == 0 {
            return Err(ConfigError::Message(
                "Resize dimensions must be greater than 0".to_string(),
            ));
        }

        if self.stream.inference_interval_ms == 0 {
            return Err(ConfigError::Message(
                "Inference interval must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.detection.violence_threshold)
            || self.detection.violence_threshold == 0.0
        {
            return Err(ConfigError::Message(
                "Violence threshold must be in (0, 1]".to_string(),
            ));
        }

        if self.detection.alert_threshold < self.detection.violence_threshold
            || self.detection.alert_threshold > 1.0
        {
            return Err(ConfigError::Message(
                "Alert threshold must be in [violence_threshold, 1]".to_string(),
            ));
        }

        if self.detection.min_consecutive == 0 || self.detection.end_consecutive == 0 {
            return Err(ConfigError::Message(
                "Consecutive frame counts must be greater than 0".to_string(),
            ));
        }

        if self.detection.smoothing_window == 0 {
            return Err(ConfigError::Message(
                "Smoothing window must be greater than 0".to_string(),
            ));
        }

        // Pre-roll beyond the ring is truncated, not an error; flag it anyway.
        let preroll_frames =
            self.detection.clip_before_seconds as usize * self.stream.target_fps as usize;
        if preroll_frames > self.stream.buffer_size {
            warn!(
                "Ring buffer ({} frames) does not cover the {}s pre-roll at {} fps; \
                 pre-roll will be truncated",
                self.stream.buffer_size, self.detection.clip_before_seconds, self.stream.target_fps
            );
        }

        Ok(())
    }

    /// Create required directories (clips, log file parent)
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.storage.clips_dir)?;
        if let Some(file) = &self.log.file {
            if let Some(parent) = Path::new(file).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }
        Ok(())
    }
}

impl Default for VigilConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: default_host(),
                port: default_port(),
                debug: default_debug(),
            },
            classifier: ClassifierConfig {
                ml_service_url: default_ml_service_url(),
                ml_service_timeout_seconds: default_ml_service_timeout(),
                model_path: None,
            },
            stream: StreamDefaults {
                buffer_size: default_buffer_size(),
                sliding_window_seconds: default_sliding_window_seconds(),
                frame_sample_rate: default_frame_sample_rate(),
                inference_interval_ms: default_inference_interval_ms(),
                target_fps: default_target_fps(),
                resize_width: default_resize_width(),
                resize_height: default_resize_height(),
                read_timeout_seconds: default_read_timeout_seconds(),
                reconnect_delay_seconds: default_reconnect_delay_seconds(),
                max_reconnect_attempts: None,
            },
            detection: DetectionConfig {
                violence_threshold: default_violence_threshold(),
                alert_threshold: default_alert_threshold(),
                min_consecutive: default_min_consecutive(),
                end_consecutive: default_end_consecutive(),
                cooldown_seconds: default_cooldown_seconds(),
                clip_before_seconds: default_clip_before_seconds(),
                clip_after_seconds: default_clip_after_seconds(),
                smoothing_window: default_smoothing_window(),
                motion_veto: default_motion_veto(),
            },
            storage: StorageConfig {
                clips_dir: default_clips_dir(),
                database_url: default_database_url(),
            },
            log: LogConfig {
                level: default_log_level(),
                file: None,
            },
        }
    }
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_debug() -> bool {
    false
}

fn default_ml_service_url() -> String {
    "http://localhost:8000".to_string()
}
fn default_ml_service_timeout() -> u64 {
    30
}

fn default_buffer_size() -> usize {
    1000
}
fn default_sliding_window_seconds() -> u32 {
    2
}
fn default_frame_sample_rate() -> usize {
    16
}
fn default_inference_interval_ms() -> u64 {
    200
}
fn default_target_fps() -> u32 {
    30
}
fn default_resize_width() -> u32 {
    640
}
fn default_resize_height() -> u32 {
    360
}
fn default_read_timeout_seconds() -> u64 {
    10
}
fn default_reconnect_delay_seconds() -> u64 {
    3
}

fn default_violence_threshold() -> f64 {
    0.50
}
fn default_alert_threshold() -> f64 {
    0.90
}
fn default_min_consecutive() -> u32 {
    2
}
fn default_end_consecutive() -> u32 {
    3
}
fn default_cooldown_seconds() -> u64 {
    5
}
fn default_clip_before_seconds() -> u64 {
    5
}
fn default_clip_after_seconds() -> u64 {
    10
}
fn default_smoothing_window() -> usize {
    3
}
fn default_motion_veto() -> bool {
    false
}

fn default_clips_dir() -> String {
    "./clips".to_string()
}
fn default_database_url() -> String {
    "sqlite://./vigil.db".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = VigilConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.stream.frame_sample_rate, 16);
        assert_eq!(config.detection.violence_threshold, 0.50);
        assert_eq!(config.detection.alert_threshold, 0.90);
    }

    #[test]
    fn test_end_threshold_is_hysteresis() {
        let config = VigilConfig::default();
        let expected = config.detection.violence_threshold * 0.8;
        assert!((config.detection.end_threshold() - expected).abs() < f64::EPSILON);
    }

    #[test]
    fn test_database_path_strips_scheme() {
        let mut storage = StorageConfig {
            clips_dir: "./clips".to_string(),
            database_url: "sqlite:///var/lib/vigil/vigil.db".to_string(),
        };
        assert_eq!(storage.database_path(), "/var/lib/vigil/vigil.db");

        storage.database_url = "./vigil.db".to_string();
        assert_eq!(storage.database_path(), "./vigil.db");
    }

    #[test]
    fn test_config_validation_rejects_bad_values() {
        let mut config = VigilConfig::default();
        config.stream.target_fps = 0;
        assert!(config.validate().is_err());

        let mut config = VigilConfig::default();
        config.detection.violence_threshold = 0.0;
        assert!(config.validate().is_err());

        let mut config = VigilConfig::default();
        config.detection.alert_threshold = 0.3; // below violence_threshold
        assert!(config.validate().is_err());

        let mut config = VigilConfig::default();
        config.stream.resize_width = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_motion_veto_off_by_default() {
        assert!(!VigilConfig::default().detection.motion_veto);
    }
}
