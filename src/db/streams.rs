use crate::db::model::{NewStream, StreamRecord};
use crate::db::{ts_from_sql, ts_to_sql, Database};
use crate::error::RepositoryError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use uuid::Uuid;

/// Durable store for stream configurations
#[async_trait]
pub trait StreamRepository: Send + Sync {
    async fn create(&self, new: NewStream) -> Result<StreamRecord, RepositoryError>;
    async fn get_by_id(&self, id: &str) -> Result<StreamRecord, RepositoryError>;
    async fn get_all_active(&self) -> Result<Vec<StreamRecord>, RepositoryError>;
    async fn update_status(
        &self,
        id: &str,
        status: &str,
        last_frame_at: Option<DateTime<Utc>>,
        error: Option<String>,
    ) -> Result<(), RepositoryError>;
    /// Persist mutable config fields (name, location, thresholds, fps, url)
    async fn update_config(&self, record: &StreamRecord) -> Result<(), RepositoryError>;
    async fn delete(&self, id: &str) -> Result<(), RepositoryError>;
}

pub struct SqliteStreamRepository {
    db: Database,
}

impl SqliteStreamRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn row_to_record(row: &Row<'_>) -> Result<StreamRecord, rusqlite::Error> {
        let stream_type: String = row.get("stream_type")?;
        let last_frame_at: Option<String> = row.get("last_frame_at")?;
        let created_at: String = row.get("created_at")?;
        let updated_at: String = row.get("updated_at")?;

        Ok(StreamRecord {
            id: row.get("id")?,
            name: row.get("name")?,
            url: row.get("url")?,
            stream_type: stream_type.parse().unwrap_or(crate::ingest::StreamKind::Rtsp),
            location: row.get("location")?,
            is_active: row.get::<_, i64>("is_active")? != 0,
            status: row.get("status")?,
            last_frame_at: last_frame_at.and_then(|s| ts_from_sql(&s).ok()),
            error_message: row.get("error_message")?,
            target_fps: row.get::<_, Option<i64>>("target_fps")?.map(|v| v as u32),
            resize_width: row.get::<_, Option<i64>>("resize_width")?.map(|v| v as u32),
            resize_height: row
                .get::<_, Option<i64>>("resize_height")?
                .map(|v| v as u32),
            custom_threshold: row.get("custom_threshold")?,
            custom_window_seconds: row
                .get::<_, Option<i64>>("custom_window_seconds")?
                .map(|v| v as u32),
            created_at: ts_from_sql(&created_at).unwrap_or_else(|_| Utc::now()),
            updated_at: ts_from_sql(&updated_at).unwrap_or_else(|_| Utc::now()),
        })
    }

    fn fetch(conn: &Connection, id: &str) -> Result<StreamRecord, RepositoryError> {
        conn.query_row(
            "SELECT * FROM streams WHERE id = ?1",
            params![id],
            Self::row_to_record,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => RepositoryError::StreamNotFound {
                id: id.to_string(),
            },
            other => other.into(),
        })
    }
}

#[async_trait]
impl StreamRepository for SqliteStreamRepository {
    async fn create(&self, new: NewStream) -> Result<StreamRecord, RepositoryError> {
        let id = Uuid::new_v4().to_string();
        self.db
            .call(move |conn| {
                let now = ts_to_sql(&Utc::now());
                conn.execute(
                    "INSERT INTO streams
                       (id, name, url, stream_type, location, is_active, status,
                        custom_threshold, custom_window_seconds, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 1, 'disconnected', ?6, ?7, ?8, ?8)",
                    params![
                        id,
                        new.name,
                        new.url,
                        new.stream_type.as_str(),
                        new.location,
                        new.custom_threshold,
                        new.custom_window_seconds.map(|v| v as i64),
                        now,
                    ],
                )?;
                Self::fetch(conn, &id)
            })
            .await
    }

    async fn get_by_id(&self, id: &str) -> Result<StreamRecord, RepositoryError> {
        let id = id.to_string();
        self.db.call(move |conn| Self::fetch(conn, &id)).await
    }

    async fn get_all_active(&self) -> Result<Vec<StreamRecord>, RepositoryError> {
        self.db
            .call(|conn| {
                let mut stmt = conn
                    .prepare("SELECT * FROM streams WHERE is_active = 1 ORDER BY created_at")?;
                let rows = stmt.query_map([], Self::row_to_record)?;
                Ok(rows.filter_map(|r| r.ok()).collect())
            })
            .await
    }

    async fn update_status(
        &self,
        id: &str,
        status: &str,
        last_frame_at: Option<DateTime<Utc>>,
        error: Option<String>,
    ) -> Result<(), RepositoryError> {
        let id = id.to_string();
        let status = status.to_string();
        self.db
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE streams
                     SET status = ?2,
                         last_frame_at = COALESCE(?3, last_frame_at),
                         error_message = ?4,
                         updated_at = ?5
                     WHERE id = ?1",
                    params![
                        id,
                        status,
                        last_frame_at.map(|ts| ts_to_sql(&ts)),
                        error,
                        ts_to_sql(&Utc::now()),
                    ],
                )?;
                if changed == 0 {
                    return Err(RepositoryError::StreamNotFound { id });
                }
                Ok(())
            })
            .await
    }

    async fn update_config(&self, record: &StreamRecord) -> Result<(), RepositoryError> {
        let record = record.clone();
        self.db
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE streams
                     SET name = ?2, url = ?3, stream_type = ?4, location = ?5,
                         target_fps = ?6, resize_width = ?7, resize_height = ?8,
                         custom_threshold = ?9, custom_window_seconds = ?10,
                         updated_at = ?11
                     WHERE id = ?1",
                    params![
                        record.id,
                        record.name,
                        record.url,
                        record.stream_type.as_str(),
                        record.location,
                        record.target_fps.map(|v| v as i64),
                        record.resize_width.map(|v| v as i64),
                        record.resize_height.map(|v| v as i64),
                        record.custom_threshold,
                        record.custom_window_seconds.map(|v| v as i64),
                        ts_to_sql(&Utc::now()),
                    ],
                )?;
                if changed == 0 {
                    return Err(RepositoryError::StreamNotFound { id: record.id });
                }
                Ok(())
            })
            .await
    }

    async fn delete(&self, id: &str) -> Result<(), RepositoryError> {
        let id = id.to_string();
        self.db
            .call(move |conn| {
                let changed = conn.execute("DELETE FROM streams WHERE id = ?1", params![id])?;
                if changed == 0 {
                    return Err(RepositoryError::StreamNotFound { id });
                }
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::StreamKind;

    async fn repo() -> SqliteStreamRepository {
        SqliteStreamRepository::new(Database::open_in_memory().await.unwrap())
    }

    fn new_stream(name: &str) -> NewStream {
        NewStream {
            name: name.to_string(),
            url: "rtsp://cam/stream".to_string(),
            stream_type: StreamKind::Rtsp,
            location: Some("lobby".to_string()),
            custom_threshold: Some(0.6),
            custom_window_seconds: None,
        }
    }

    #[tokio::test]
    async fn test_create_then_get_round_trip() {
        let repo = repo().await;
        let created = repo.create(new_stream("cam-1")).await.unwrap();

        let fetched = repo.get_by_id(&created.id).await.unwrap();
        assert_eq!(fetched.name, "cam-1");
        assert_eq!(fetched.url, "rtsp://cam/stream");
        assert_eq!(fetched.stream_type, StreamKind::Rtsp);
        assert_eq!(fetched.location.as_deref(), Some("lobby"));
        assert_eq!(fetched.custom_threshold, Some(0.6));
        assert!(fetched.is_active);
        assert_eq!(fetched.status, "disconnected");
    }

    #[tokio::test]
    async fn test_get_all_active_excludes_deleted() {
        let repo = repo().await;
        let a = repo.create(new_stream("a")).await.unwrap();
        let _b = repo.create(new_stream("b")).await.unwrap();

        repo.delete(&a.id).await.unwrap();
        let active = repo.get_all_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "b");
    }

    #[tokio::test]
    async fn test_update_status() {
        let repo = repo().await;
        let stream = repo.create(new_stream("cam")).await.unwrap();

        let now = Utc::now();
        repo.update_status(&stream.id, "connected", Some(now), None)
            .await
            .unwrap();

        let fetched = repo.get_by_id(&stream.id).await.unwrap();
        assert_eq!(fetched.status, "connected");
        assert!(fetched.last_frame_at.is_some());

        repo.update_status(&stream.id, "error", None, Some("boom".to_string()))
            .await
            .unwrap();
        let fetched = repo.get_by_id(&stream.id).await.unwrap();
        assert_eq!(fetched.status, "error");
        assert_eq!(fetched.error_message.as_deref(), Some("boom"));
        // last_frame_at preserved when not supplied
        assert!(fetched.last_frame_at.is_some());
    }

    #[tokio::test]
    async fn test_update_config_persists_mutable_fields() {
        let repo = repo().await;
        let mut stream = repo.create(new_stream("cam")).await.unwrap();

        stream.name = "renamed".to_string();
        stream.custom_threshold = Some(0.8);
        stream.target_fps = Some(15);
        repo.update_config(&stream).await.unwrap();

        let fetched = repo.get_by_id(&stream.id).await.unwrap();
        assert_eq!(fetched.name, "renamed");
        assert_eq!(fetched.custom_threshold, Some(0.8));
        assert_eq!(fetched.target_fps, Some(15));
    }

    #[tokio::test]
    async fn test_missing_stream_errors() {
        let repo = repo().await;
        assert!(matches!(
            repo.get_by_id("nope").await,
            Err(RepositoryError::StreamNotFound { .. })
        ));
        assert!(repo.delete("nope").await.is_err());
        assert!(repo
            .update_status("nope", "connected", None, None)
            .await
            .is_err());
    }
}
