use crate::classify::FrameClassifier;
use crate::clip::{ClipRecorder, PersonCapture};
use crate::config::VigilConfig;
use crate::db::{EventRepository, NewStream, StreamRecord, StreamRepository};
use crate::detector::{DetectorConfig, DetectorPhase, EventDetector};
use crate::error::{ManagerError, Result, VigilError};
use crate::hub::{BroadcastHub, WsMessage};
use crate::inference::{InferenceScheduler, SchedulerConfig};
use crate::ingest::{DecoderFactory, SourceStatus, StreamIngestion, StreamKind, StreamSpec};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Request body for creating a stream
#[derive(Debug, Clone)]
pub struct AddStreamRequest {
    pub name: String,
    pub url: String,
    /// Auto-detected from the URL prefix when absent
    pub stream_type: Option<StreamKind>,
    pub location: Option<String>,
    pub auto_start: bool,
    pub custom_threshold: Option<f64>,
}

/// Mutable fields accepted by stream updates
#[derive(Debug, Clone, Default)]
pub struct StreamPatch {
    pub name: Option<String>,
    pub url: Option<String>,
    pub location: Option<String>,
    pub target_fps: Option<u32>,
    pub custom_threshold: Option<Option<f64>>,
    pub custom_window_seconds: Option<Option<u32>>,
}

/// Running component graph of one stream
#[derive(Clone)]
pub struct StreamInstance {
    pub ingestion: Arc<StreamIngestion>,
    pub scheduler: Arc<InferenceScheduler>,
    pub detector: Arc<EventDetector>,
}

enum StreamEntry {
    /// Persisted config only; the pipeline materializes on first start
    Lazy(StreamRecord),
    Running(StreamInstance),
}

/// Owns the set of streams and their per-stream pipelines.
///
/// At most one running component graph exists per stream id. Persisted
/// streams are loaded lazily at startup; detectors and schedulers receive
/// their collaborators here, never the manager itself.
pub struct StreamManager {
    config: VigilConfig,
    streams: RwLock<HashMap<String, StreamEntry>>,
    stream_repo: Arc<dyn StreamRepository>,
    event_repo: Arc<dyn EventRepository>,
    hub: BroadcastHub,
    classifier: Arc<dyn FrameClassifier>,
    recorder: Arc<ClipRecorder>,
    person_capture: Option<Arc<PersonCapture>>,
    decoder_factory: DecoderFactory,
}

impl StreamManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: VigilConfig,
        stream_repo: Arc<dyn StreamRepository>,
        event_repo: Arc<dyn EventRepository>,
        hub: BroadcastHub,
        classifier: Arc<dyn FrameClassifier>,
        recorder: Arc<ClipRecorder>,
        person_capture: Option<Arc<PersonCapture>>,
        decoder_factory: DecoderFactory,
    ) -> Self {
        Self {
            config,
            streams: RwLock::new(HashMap::new()),
            stream_repo,
            event_repo,
            hub,
            classifier,
            recorder,
            person_capture,
            decoder_factory,
        }
    }

    /// Load persisted streams as lazy entries
    pub async fn initialize(&self) -> Result<()> {
        let records = self.stream_repo.get_all_active().await?;
        let mut streams = self.streams.write().await;
        for record in records {
            info!("Loaded stream from repository: {} (lazy)", record.name);
            streams.insert(record.id.clone(), StreamEntry::Lazy(record));
        }
        info!("Stream manager initialized with {} streams", streams.len());
        Ok(())
    }

    pub async fn streams_count(&self) -> usize {
        self.streams.read().await.len()
    }

    pub async fn add_stream(&self, request: AddStreamRequest) -> Result<String> {
        if request.name.trim().is_empty() || request.url.trim().is_empty() {
            return Err(ManagerError::InvalidConfig {
                details: "name and url are required".to_string(),
            }
            .into());
        }

        let stream_type = request
            .stream_type
            .unwrap_or_else(|| StreamKind::detect(&request.url));

        let record = self
            .stream_repo
            .create(NewStream {
                name: request.name.clone(),
                url: request.url.clone(),
                stream_type,
                location: request.location.clone(),
                custom_threshold: request.custom_threshold,
                custom_window_seconds: None,
            })
            .await?;
        let stream_id = record.id.clone();

        self.streams
            .write()
            .await
            .insert(stream_id.clone(), StreamEntry::Lazy(record));
        info!("Added stream {} ({})", request.name, stream_id);

        if request.auto_start {
            self.start_stream(&stream_id).await?;
        }

        Ok(stream_id)
    }

    /// Materialize and start the pipeline for a stream
    pub async fn start_stream(&self, id: &str) -> Result<()> {
        let mut streams = self.streams.write().await;

        match streams.get(id) {
            None => {
                return Err(ManagerError::StreamNotFound { id: id.to_string() }.into());
            }
            Some(StreamEntry::Running(_)) => {
                return Err(ManagerError::AlreadyRunning { id: id.to_string() }.into());
            }
            Some(StreamEntry::Lazy(_)) => {}
        }

        // Read the freshest persisted config; updates may have landed
        let record = self.stream_repo.get_by_id(id).await?;
        let instance = self.build_instance(&record);

        instance.ingestion.start();
        instance.scheduler.start().await;

        streams.insert(id.to_string(), StreamEntry::Running(instance));
        drop(streams);

        self.hub.publish(WsMessage::StreamStarted {
            stream_id: id.to_string(),
            name: record.name.clone(),
        });
        info!("Started stream {} ({})", record.name, id);
        Ok(())
    }

    /// Stop a running pipeline, forcing any open event to finalize
    pub async fn stop_stream(&self, id: &str) -> Result<()> {
        let instance = {
            let mut streams = self.streams.write().await;
            let instance = match streams.get(id) {
                None => {
                    return Err(ManagerError::StreamNotFound { id: id.to_string() }.into());
                }
                Some(StreamEntry::Lazy(_)) => {
                    return Err(ManagerError::NotRunning { id: id.to_string() }.into());
                }
                Some(StreamEntry::Running(instance)) => instance.clone(),
            };

            let record = self.stream_repo.get_by_id(id).await?;
            streams.insert(id.to_string(), StreamEntry::Lazy(record));
            instance
        };

        // Scheduler first (no more ticks), then capture, then the forced
        // finalize which drains whatever the ring still holds.
        instance.scheduler.stop().await;
        let ingestion = Arc::clone(&instance.ingestion);
        tokio::task::spawn_blocking(move || ingestion.stop())
            .await
            .map_err(|e| VigilError::system(format!("capture stop failed: {}", e)))?;
        instance.detector.on_stream_stop().await;

        let name = instance.ingestion.spec().name.clone();
        if let Err(e) = self
            .stream_repo
            .update_status(id, "stopped", None, None)
            .await
        {
            warn!("Failed to persist stop for {}: {}", id, e);
        }
        self.hub.publish(WsMessage::StreamStopped {
            stream_id: id.to_string(),
            name,
        });
        info!("Stopped stream {}", id);
        Ok(())
    }

    /// Stop (if needed) and delete a stream
    pub async fn remove_stream(&self, id: &str) -> Result<()> {
        match self.stop_stream(id).await {
            Ok(()) => {}
            Err(VigilError::Manager(ManagerError::NotRunning { .. })) => {}
            Err(VigilError::Manager(ManagerError::StreamNotFound { .. })) => {
                return Err(ManagerError::StreamNotFound { id: id.to_string() }.into());
            }
            Err(e) => return Err(e),
        }

        self.streams.write().await.remove(id);
        self.stream_repo.delete(id).await?;
        info!("Removed stream {}", id);
        Ok(())
    }

    /// Apply config updates. Returns the new record and whether a restart
    /// is required for the change to take effect (URL changed while running).
    pub async fn update_stream(
        &self,
        id: &str,
        patch: StreamPatch,
    ) -> Result<(StreamRecord, bool)> {
        let mut record = self.stream_repo.get_by_id(id).await?;

        let url_changed = patch
            .url
            .as_ref()
            .map(|url| url != &record.url)
            .unwrap_or(false);

        if let Some(name) = patch.name {
            record.name = name;
        }
        if let Some(url) = patch.url {
            record.stream_type = StreamKind::detect(&url);
            record.url = url;
        }
        if let Some(location) = patch.location {
            record.location = Some(location);
        }
        if let Some(fps) = patch.target_fps {
            record.target_fps = Some(fps);
        }
        if let Some(threshold) = patch.custom_threshold {
            record.custom_threshold = threshold;
        }
        if let Some(window) = patch.custom_window_seconds {
            record.custom_window_seconds = window;
        }

        self.stream_repo.update_config(&record).await?;

        let running = matches!(
            self.streams.read().await.get(id),
            Some(StreamEntry::Running(_))
        );
        if let Some(StreamEntry::Lazy(lazy)) = self.streams.write().await.get_mut(id) {
            *lazy = record.clone();
        }

        Ok((record, url_changed && running))
    }

    /// Running component graph for a stream, if materialized
    pub async fn get_instance(&self, id: &str) -> Option<StreamInstance> {
        match self.streams.read().await.get(id) {
            Some(StreamEntry::Running(instance)) => Some(instance.clone()),
            _ => None,
        }
    }

    /// Combined {stream, pipeline, detector} status document
    pub async fn get_status(&self, id: &str) -> Result<serde_json::Value> {
        let record = self.stream_repo.get_by_id(id).await?;
        let streams = self.streams.read().await;

        match streams.get(id) {
            Some(StreamEntry::Running(instance)) => {
                let ingest = instance.ingestion.status();
                let (ticks, skipped) = instance.scheduler.tick_counts();
                let detector = instance.detector.status().await;
                Ok(json!({
                    "stream": {
                        "id": record.id,
                        "name": record.name,
                        "url": record.url,
                        "stream_type": record.stream_type.as_str(),
                        "location": record.location,
                        "status": ingest.phase.as_str(),
                        "is_running": true,
                        "is_connected": ingest.phase == SourceStatus::Connected,
                        "frame_count": ingest.frame_count,
                        "buffer_size": ingest.buffer_len,
                        "last_frame_at": ingest.last_frame_at,
                        "error_message": ingest.last_error,
                        "reconnects": ingest.reconnects,
                    },
                    "pipeline": {
                        "is_running": true,
                        "model_loaded": self.classifier.is_loaded(),
                        "ticks": ticks,
                        "skipped_ticks": skipped,
                        "last_score": instance.scheduler.last_score(),
                    },
                    "detector": detector,
                }))
            }
            Some(StreamEntry::Lazy(_)) | None => Ok(json!({
                "stream": {
                    "id": record.id,
                    "name": record.name,
                    "url": record.url,
                    "stream_type": record.stream_type.as_str(),
                    "location": record.location,
                    "status": "stopped",
                    "is_running": false,
                    "is_connected": false,
                    "frame_count": 0,
                    "buffer_size": 0,
                    "last_frame_at": record.last_frame_at,
                    "error_message": record.error_message,
                    "reconnects": 0,
                },
                "pipeline": {
                    "is_running": false,
                    "model_loaded": self.classifier.is_loaded(),
                },
                "detector": { "phase": DetectorPhase::Idle },
            })),
        }
    }

    pub async fn get_all_status(&self) -> Vec<serde_json::Value> {
        let ids: Vec<String> = self.streams.read().await.keys().cloned().collect();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(status) = self.get_status(&id).await {
                out.push(status);
            }
        }
        out
    }

    /// Stop every running stream; in-flight events are force-finalized
    pub async fn shutdown(&self) {
        info!("Shutting down stream manager");
        let ids: Vec<String> = self
            .streams
            .read()
            .await
            .iter()
            .filter_map(|(id, entry)| match entry {
                StreamEntry::Running(_) => Some(id.clone()),
                StreamEntry::Lazy(_) => None,
            })
            .collect();

        for id in ids {
            if let Err(e) = self.stop_stream(&id).await {
                error!("Error stopping stream {}: {}", id, e);
            }
        }
        info!("Stream manager shutdown complete");
    }

    fn build_instance(&self, record: &StreamRecord) -> StreamInstance {
        let defaults = &self.config.stream;
        let detection = &self.config.detection;

        let spec = StreamSpec {
            id: record.id.clone(),
            name: record.name.clone(),
            url: record.url.clone(),
            kind: record.stream_type,
            target_fps: record.target_fps.unwrap_or(defaults.target_fps),
            resize_width: record.resize_width.unwrap_or(defaults.resize_width),
            resize_height: record.resize_height.unwrap_or(defaults.resize_height),
            buffer_size: defaults.buffer_size,
            read_timeout: Duration::from_secs(defaults.read_timeout_seconds),
            reconnect_delay: Duration::from_secs(defaults.reconnect_delay_seconds),
            max_reconnect_attempts: defaults.max_reconnect_attempts,
        };

        let ingestion = StreamIngestion::new(spec, Arc::clone(&self.decoder_factory));

        // The capture worker lives on a blocking thread; status changes hop
        // back onto the runtime for the repository write and fan out
        // synchronously to the hub.
        let hub = self.hub.clone();
        let repo = Arc::clone(&self.stream_repo);
        let stream_id = record.id.clone();
        let runtime = tokio::runtime::Handle::current();
        ingestion.set_on_status_change(Arc::new(move |status, message| {
            hub.publish(WsMessage::StreamStatus {
                stream_id: stream_id.clone(),
                status: status.as_str().to_string(),
                message: message.clone(),
            });

            let repo = Arc::clone(&repo);
            let stream_id = stream_id.clone();
            runtime.spawn(async move {
                let last_frame_at = (status == SourceStatus::Connected)
                    .then(chrono::Utc::now);
                if let Err(e) = repo
                    .update_status(&stream_id, status.as_str(), last_frame_at, message)
                    .await
                {
                    warn!("Failed to persist status for {}: {}", stream_id, e);
                }
            });
        }));

        let threshold = record
            .custom_threshold
            .unwrap_or(detection.violence_threshold);

        let detector = EventDetector::new(
            DetectorConfig {
                stream_id: record.id.clone(),
                stream_name: record.name.clone(),
                threshold,
                alert_threshold: detection.alert_threshold.max(threshold),
                min_consecutive: detection.min_consecutive,
                end_consecutive: detection.end_consecutive,
                cooldown: Duration::from_secs(detection.cooldown_seconds),
                clip_before: Duration::from_secs(detection.clip_before_seconds),
                clip_after: Duration::from_secs(detection.clip_after_seconds),
                motion_veto: detection.motion_veto,
            },
            Arc::clone(&ingestion),
            Arc::clone(&self.event_repo),
            self.hub.clone(),
            Arc::clone(&self.recorder),
            self.person_capture.clone(),
        );

        let scheduler = InferenceScheduler::new(
            SchedulerConfig {
                interval: Duration::from_millis(defaults.inference_interval_ms),
                window: defaults.frame_sample_rate,
                threshold,
            },
            Arc::clone(&ingestion),
            Arc::clone(&self.classifier),
            Arc::clone(&detector),
            self.hub.clone(),
            Arc::clone(&self.event_repo),
            detection.smoothing_window,
            detection.alert_threshold,
        );

        StreamInstance {
            ingestion,
            scheduler,
            detector,
        }
    }
}
