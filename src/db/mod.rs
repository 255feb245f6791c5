pub mod events;
pub mod model;
pub mod streams;

pub use events::{EventRepository, SqliteEventRepository};
pub use model::{
    EventFilter, EventFinalization, EventRecord, EventStatistics, EventStatus, InferenceLogEntry,
    NewEvent, NewStream, Severity, StreamRecord,
};
pub use streams::{SqliteStreamRepository, StreamRepository};

use crate::error::RepositoryError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS streams (
    id                    TEXT PRIMARY KEY,
    name                  TEXT NOT NULL,
    url                   TEXT NOT NULL,
    stream_type           TEXT NOT NULL DEFAULT 'rtsp',
    location              TEXT,
    is_active             INTEGER NOT NULL DEFAULT 1,
    status                TEXT NOT NULL DEFAULT 'disconnected',
    last_frame_at         TEXT,
    error_message         TEXT,
    target_fps            INTEGER,
    resize_width          INTEGER,
    resize_height         INTEGER,
    custom_threshold      REAL,
    custom_window_seconds INTEGER,
    created_at            TEXT NOT NULL,
    updated_at            TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_streams_is_active ON streams(is_active);

CREATE TABLE IF NOT EXISTS events (
    id               TEXT PRIMARY KEY,
    stream_id        TEXT NOT NULL,
    stream_name      TEXT NOT NULL,
    start_ts         TEXT NOT NULL,
    end_ts           TEXT,
    duration_seconds REAL,
    max_confidence   REAL NOT NULL,
    avg_confidence   REAL NOT NULL,
    min_confidence   REAL NOT NULL,
    frame_count      INTEGER NOT NULL DEFAULT 0,
    severity         TEXT NOT NULL,
    status           TEXT NOT NULL DEFAULT 'PENDING',
    clip_path        TEXT,
    clip_duration    REAL,
    thumbnail_path   TEXT,
    person_images    TEXT NOT NULL DEFAULT '[]',
    reviewed_at      TEXT,
    reviewed_by      TEXT,
    notes            TEXT,
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_stream_start ON events(stream_id, start_ts);
CREATE INDEX IF NOT EXISTS idx_events_status ON events(status);
CREATE INDEX IF NOT EXISTS idx_events_status_severity_start
    ON events(status, severity, start_ts);

CREATE TABLE IF NOT EXISTS inference_logs (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    stream_id         TEXT NOT NULL,
    timestamp         TEXT NOT NULL,
    violence_score    REAL NOT NULL,
    non_violence_score REAL NOT NULL,
    inference_ms      REAL,
    frame_number      INTEGER,
    window_start      TEXT,
    window_end        TEXT
);
CREATE INDEX IF NOT EXISTS idx_inference_logs_stream_ts
    ON inference_logs(stream_id, timestamp);
"#;

/// SQLite-backed store shared by the repositories.
///
/// A single connection behind a mutex; every call runs on the blocking pool
/// so repository I/O never stalls the inference or capture workers.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database at `path` and apply the schema
    pub async fn open(path: &str) -> Result<Self, RepositoryError> {
        let path = path.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path).map_err(|e| RepositoryError::Open {
                path: path.clone(),
                details: e.to_string(),
            })?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.execute_batch(SCHEMA)
                .map_err(|e| RepositoryError::Migration {
                    details: e.to_string(),
                })?;
            info!("Database ready at {}", path);
            Ok(Self {
                conn: Arc::new(Mutex::new(conn)),
            })
        })
        .await
        .map_err(|e| RepositoryError::Open {
            path: "<join>".to_string(),
            details: e.to_string(),
        })?
    }

    /// Open with startup retries: `attempts` tries, `delay` apart.
    /// Exhaustion is fatal to process startup.
    pub async fn open_with_retry(
        path: &str,
        attempts: u32,
        delay: Duration,
    ) -> Result<Self, RepositoryError> {
        let mut last_err = None;
        for attempt in 1..=attempts {
            match Self::open(path).await {
                Ok(db) => return Ok(db),
                Err(e) => {
                    warn!(
                        "Database open attempt {}/{} failed: {}",
                        attempt, attempts, e
                    );
                    last_err = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        error!("Database unreachable after {} attempts", attempts);
        Err(last_err.unwrap())
    }

    /// In-memory database for tests
    pub async fn open_in_memory() -> Result<Self, RepositoryError> {
        Self::open(":memory:").await
    }

    /// Run a closure against the connection on the blocking pool
    pub async fn call<F, T>(&self, f: F) -> Result<T, RepositoryError>
    where
        F: FnOnce(&Connection) -> Result<T, RepositoryError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn)
        })
        .await
        .map_err(|e| RepositoryError::Query {
            details: format!("blocking task failed: {}", e),
        })?
    }
}

/// Serialize a timestamp for storage
pub(crate) fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

/// Parse a stored timestamp
pub(crate) fn ts_from_sql(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query {
            details: format!("bad timestamp '{}': {}", s, e),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_creates_schema() {
        let db = Database::open_in_memory().await.unwrap();
        let tables: Vec<String> = db
            .call(|conn| {
                let mut stmt = conn
                    .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                    .map_err(RepositoryError::from)?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))
                    .map_err(RepositoryError::from)?;
                Ok(rows.filter_map(|r| r.ok()).collect())
            })
            .await
            .unwrap();

        assert!(tables.contains(&"streams".to_string()));
        assert!(tables.contains(&"events".to_string()));
        assert!(tables.contains(&"inference_logs".to_string()));
    }

    #[tokio::test]
    async fn test_required_indexes_exist() {
        let db = Database::open_in_memory().await.unwrap();
        let indexes: Vec<String> = db
            .call(|conn| {
                let mut stmt = conn
                    .prepare("SELECT name FROM sqlite_master WHERE type='index'")
                    .map_err(RepositoryError::from)?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))
                    .map_err(RepositoryError::from)?;
                Ok(rows.filter_map(|r| r.ok()).collect())
            })
            .await
            .unwrap();

        for required in [
            "idx_streams_is_active",
            "idx_events_stream_start",
            "idx_events_status",
            "idx_events_status_severity_start",
        ] {
            assert!(indexes.iter().any(|i| i == required), "missing {}", required);
        }
    }

    #[tokio::test]
    async fn test_open_with_retry_fails_on_bad_path() {
        let result = Database::open_with_retry(
            "/nonexistent-dir/sub/vigil.db",
            2,
            Duration::from_millis(10),
        )
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_timestamp_round_trip() {
        let now = Utc::now();
        let restored = ts_from_sql(&ts_to_sql(&now)).unwrap();
        assert_eq!(now.timestamp_micros(), restored.timestamp_micros());
    }
}
