use crate::db::model::{
    EventFilter, EventFinalization, EventRecord, EventStatistics, EventStatus, InferenceLogEntry,
    NewEvent, Severity,
};
use crate::db::{ts_from_sql, ts_to_sql, Database};
use crate::error::RepositoryError;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use rusqlite::{params, params_from_iter, Connection, Row};
use std::collections::HashMap;
use tracing::debug;

/// Durable store for detection events
#[async_trait]
pub trait EventRepository: Send + Sync {
    async fn create(&self, new: NewEvent) -> Result<EventRecord, RepositoryError>;
    async fn get_by_id(&self, id: &str) -> Result<EventRecord, RepositoryError>;
    async fn list(&self, filter: EventFilter) -> Result<Vec<EventRecord>, RepositoryError>;
    async fn count(&self, filter: &EventFilter) -> Result<u64, RepositoryError>;
    /// Review transition. Rejected when the event is no longer PENDING.
    async fn update_status(
        &self,
        id: &str,
        status: EventStatus,
        reviewed_by: Option<String>,
        notes: Option<String>,
    ) -> Result<EventRecord, RepositoryError>;
    /// Atomic finalization: end time, stats over the score series, severity
    /// and artifact paths land in one transaction.
    async fn finalize(
        &self,
        id: &str,
        finalization: EventFinalization,
    ) -> Result<EventRecord, RepositoryError>;
    async fn statistics(&self, days: u32) -> Result<EventStatistics, RepositoryError>;
    /// Best-effort analytics log of every inference tick
    async fn log_inference(&self, entry: InferenceLogEntry) -> Result<(), RepositoryError>;
}

pub struct SqliteEventRepository {
    db: Database,
}

impl SqliteEventRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn row_to_record(row: &Row<'_>) -> Result<EventRecord, rusqlite::Error> {
        let start_ts: String = row.get("start_ts")?;
        let end_ts: Option<String> = row.get("end_ts")?;
        let reviewed_at: Option<String> = row.get("reviewed_at")?;
        let created_at: String = row.get("created_at")?;
        let updated_at: String = row.get("updated_at")?;
        let severity: String = row.get("severity")?;
        let status: String = row.get("status")?;
        let person_images: String = row.get("person_images")?;

        Ok(EventRecord {
            id: row.get("id")?,
            stream_id: row.get("stream_id")?,
            stream_name: row.get("stream_name")?,
            start_ts: ts_from_sql(&start_ts).unwrap_or_else(|_| Utc::now()),
            end_ts: end_ts.and_then(|s| ts_from_sql(&s).ok()),
            duration_seconds: row.get("duration_seconds")?,
            max_confidence: row.get("max_confidence")?,
            avg_confidence: row.get("avg_confidence")?,
            min_confidence: row.get("min_confidence")?,
            frame_count: row.get::<_, i64>("frame_count")? as u32,
            severity: severity.parse().unwrap_or(Severity::Low),
            status: status.parse().unwrap_or(EventStatus::Pending),
            clip_path: row.get("clip_path")?,
            clip_duration: row.get("clip_duration")?,
            thumbnail_path: row.get("thumbnail_path")?,
            person_images: serde_json::from_str(&person_images).unwrap_or_default(),
            reviewed_at: reviewed_at.and_then(|s| ts_from_sql(&s).ok()),
            reviewed_by: row.get("reviewed_by")?,
            notes: row.get("notes")?,
            created_at: ts_from_sql(&created_at).unwrap_or_else(|_| Utc::now()),
            updated_at: ts_from_sql(&updated_at).unwrap_or_else(|_| Utc::now()),
        })
    }

    fn fetch(conn: &Connection, id: &str) -> Result<EventRecord, RepositoryError> {
        conn.query_row(
            "SELECT * FROM events WHERE id = ?1",
            params![id],
            Self::row_to_record,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => RepositoryError::EventNotFound {
                id: id.to_string(),
            },
            other => other.into(),
        })
    }

    /// Build the WHERE clause and its positional text arguments.
    /// Every filterable column is stored as TEXT, so plain strings suffice.
    fn filter_clauses(filter: &EventFilter) -> (String, Vec<String>) {
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<String> = Vec::new();

        if let Some(status) = filter.status {
            clauses.push(format!("status = ?{}", args.len() + 1));
            args.push(status.as_str().to_string());
        }
        if let Some(stream_id) = &filter.stream_id {
            clauses.push(format!("stream_id = ?{}", args.len() + 1));
            args.push(stream_id.clone());
        }
        if let Some(after) = filter.start_after {
            clauses.push(format!("start_ts > ?{}", args.len() + 1));
            args.push(ts_to_sql(&after));
        }
        if let Some(before) = filter.start_before {
            clauses.push(format!("start_ts < ?{}", args.len() + 1));
            args.push(ts_to_sql(&before));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        (where_sql, args)
    }
}

#[async_trait]
impl EventRepository for SqliteEventRepository {
    async fn create(&self, new: NewEvent) -> Result<EventRecord, RepositoryError> {
        self.db
            .call(move |conn| {
                let now = ts_to_sql(&Utc::now());
                let severity = Severity::from_confidence(new.opening_score);
                conn.execute(
                    "INSERT INTO events
                       (id, stream_id, stream_name, start_ts,
                        max_confidence, avg_confidence, min_confidence, frame_count,
                        severity, status, person_images, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?5, ?6, ?7, 'PENDING', '[]', ?8, ?8)",
                    params![
                        new.id,
                        new.stream_id,
                        new.stream_name,
                        ts_to_sql(&new.start_ts),
                        new.opening_score,
                        new.frame_count as i64,
                        severity.as_str(),
                        now,
                    ],
                )?;
                Self::fetch(conn, &new.id)
            })
            .await
    }

    async fn get_by_id(&self, id: &str) -> Result<EventRecord, RepositoryError> {
        let id = id.to_string();
        self.db.call(move |conn| Self::fetch(conn, &id)).await
    }

    async fn list(&self, filter: EventFilter) -> Result<Vec<EventRecord>, RepositoryError> {
        self.db
            .call(move |conn| {
                let (where_sql, args) = Self::filter_clauses(&filter);
                let limit = filter.limit.unwrap_or(50).min(500);
                let offset = filter.offset.unwrap_or(0);
                let sql = format!(
                    "SELECT * FROM events{} ORDER BY start_ts DESC LIMIT {} OFFSET {}",
                    where_sql, limit, offset
                );

                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(
                    params_from_iter(args.iter()),
                    Self::row_to_record,
                )?;
                Ok(rows.filter_map(|r| r.ok()).collect())
            })
            .await
    }

    async fn count(&self, filter: &EventFilter) -> Result<u64, RepositoryError> {
        let filter = filter.clone();
        self.db
            .call(move |conn| {
                let (where_sql, args) = Self::filter_clauses(&filter);
                let sql = format!("SELECT COUNT(*) FROM events{}", where_sql);
                let count: i64 = conn.query_row(
                    &sql,
                    params_from_iter(args.iter()),
                    |row| row.get(0),
                )?;
                Ok(count as u64)
            })
            .await
    }

    async fn update_status(
        &self,
        id: &str,
        status: EventStatus,
        reviewed_by: Option<String>,
        notes: Option<String>,
    ) -> Result<EventRecord, RepositoryError> {
        let id = id.to_string();
        self.db
            .call(move |conn| {
                let current = Self::fetch(conn, &id)?;
                if current.status.is_terminal() {
                    return Err(RepositoryError::AlreadyReviewed {
                        id,
                        status: current.status.to_string(),
                    });
                }

                let now = ts_to_sql(&Utc::now());
                conn.execute(
                    "UPDATE events
                     SET status = ?2, reviewed_at = ?3, reviewed_by = ?4,
                         notes = COALESCE(?5, notes), updated_at = ?3
                     WHERE id = ?1",
                    params![id, status.as_str(), now, reviewed_by, notes],
                )?;
                Self::fetch(conn, &id)
            })
            .await
    }

    async fn finalize(
        &self,
        id: &str,
        finalization: EventFinalization,
    ) -> Result<EventRecord, RepositoryError> {
        let id = id.to_string();
        self.db
            .call(move |conn| {
                let current = Self::fetch(conn, &id)?;

                let scores = &finalization.scores;
                let (max, min, avg) = if scores.is_empty() {
                    (
                        current.max_confidence,
                        current.min_confidence,
                        current.avg_confidence,
                    )
                } else {
                    let max = scores.iter().cloned().fold(f64::MIN, f64::max);
                    let min = scores.iter().cloned().fold(f64::MAX, f64::min);
                    let avg = scores.iter().sum::<f64>() / scores.len() as f64;
                    (max, min, avg)
                };
                let severity = Severity::from_confidence(max);
                let duration = (finalization.end_ts - current.start_ts)
                    .num_milliseconds()
                    .max(0) as f64
                    / 1000.0;
                let person_images = serde_json::to_string(&finalization.person_images)
                    .unwrap_or_else(|_| "[]".to_string());

                let tx = conn.unchecked_transaction()?;
                tx.execute(
                    "UPDATE events
                     SET end_ts = ?2, duration_seconds = ?3,
                         max_confidence = ?4, avg_confidence = ?5, min_confidence = ?6,
                         frame_count = ?7, severity = ?8,
                         clip_path = ?9, clip_duration = ?10, thumbnail_path = ?11,
                         person_images = ?12, updated_at = ?13
                     WHERE id = ?1",
                    params![
                        id,
                        ts_to_sql(&finalization.end_ts),
                        duration,
                        max,
                        avg,
                        min,
                        finalization.frame_count as i64,
                        severity.as_str(),
                        finalization.clip_path,
                        finalization.clip_duration,
                        finalization.thumbnail_path,
                        person_images,
                        ts_to_sql(&Utc::now()),
                    ],
                )?;
                tx.commit()?;

                Self::fetch(conn, &id)
            })
            .await
    }

    async fn statistics(&self, days: u32) -> Result<EventStatistics, RepositoryError> {
        self.db
            .call(move |conn| {
                let since = ts_to_sql(&(Utc::now() - ChronoDuration::days(days as i64)));

                let total: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM events WHERE start_ts >= ?1",
                    params![since],
                    |row| row.get(0),
                )?;

                let mut by_status = HashMap::new();
                let mut stmt = conn.prepare(
                    "SELECT status, COUNT(*) FROM events WHERE start_ts >= ?1 GROUP BY status",
                )?;
                let rows = stmt.query_map(params![since], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?;
                for row in rows.flatten() {
                    by_status.insert(row.0, row.1 as u64);
                }

                let mut by_severity = HashMap::new();
                let mut stmt = conn.prepare(
                    "SELECT severity, COUNT(*) FROM events WHERE start_ts >= ?1 GROUP BY severity",
                )?;
                let rows = stmt.query_map(params![since], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?;
                for row in rows.flatten() {
                    by_severity.insert(row.0, row.1 as u64);
                }

                let mut by_stream = HashMap::new();
                let mut stmt = conn.prepare(
                    "SELECT stream_id, COUNT(*) FROM events WHERE start_ts >= ?1 \
                     GROUP BY stream_id",
                )?;
                let rows = stmt.query_map(params![since], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?;
                for row in rows.flatten() {
                    by_stream.insert(row.0, row.1 as u64);
                }

                Ok(EventStatistics {
                    days,
                    total: total as u64,
                    by_status,
                    by_severity,
                    by_stream,
                })
            })
            .await
    }

    async fn log_inference(&self, entry: InferenceLogEntry) -> Result<(), RepositoryError> {
        let result = self
            .db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO inference_logs
                       (stream_id, timestamp, violence_score, non_violence_score,
                        inference_ms, frame_number, window_start, window_end)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        entry.stream_id,
                        ts_to_sql(&entry.timestamp),
                        entry.violence_score,
                        entry.non_violence_score,
                        entry.inference_ms,
                        entry.frame_number as i64,
                        ts_to_sql(&entry.window_start),
                        ts_to_sql(&entry.window_end),
                    ],
                )?;
                Ok(())
            })
            .await;

        if let Err(e) = &result {
            debug!("Inference log write failed: {}", e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn repo() -> SqliteEventRepository {
        SqliteEventRepository::new(Database::open_in_memory().await.unwrap())
    }

    fn new_event(stream_id: &str, score: f64) -> NewEvent {
        NewEvent {
            id: Uuid::new_v4().to_string(),
            stream_id: stream_id.to_string(),
            stream_name: "cam".to_string(),
            start_ts: Utc::now(),
            opening_score: score,
            frame_count: 16,
        }
    }

    fn finalization(scores: Vec<f64>) -> EventFinalization {
        EventFinalization {
            end_ts: Utc::now() + ChronoDuration::seconds(12),
            scores,
            frame_count: 40,
            clip_path: Some("clip.mp4".to_string()),
            clip_duration: Some(19.0),
            thumbnail_path: Some("clip_thumb.jpg".to_string()),
            person_images: vec!["p1.jpg".to_string()],
        }
    }

    #[tokio::test]
    async fn test_create_seeds_stats_from_opening_score() {
        let repo = repo().await;
        let event = repo.create(new_event("s1", 0.88)).await.unwrap();

        assert_eq!(event.status, EventStatus::Pending);
        assert_eq!(event.severity, Severity::High);
        assert_eq!(event.max_confidence, 0.88);
        assert_eq!(event.avg_confidence, 0.88);
        assert_eq!(event.min_confidence, 0.88);
        assert_eq!(event.frame_count, 16);
        assert!(event.end_ts.is_none());
    }

    #[tokio::test]
    async fn test_finalize_computes_stats_and_severity() {
        let repo = repo().await;
        let event = repo.create(new_event("s1", 0.6)).await.unwrap();

        let finalized = repo
            .finalize(&event.id, finalization(vec![0.6, 0.97, 0.8]))
            .await
            .unwrap();

        assert!((finalized.max_confidence - 0.97).abs() < 1e-9);
        assert!((finalized.min_confidence - 0.6).abs() < 1e-9);
        assert!((finalized.avg_confidence - 0.79).abs() < 1e-9);
        assert_eq!(finalized.severity, Severity::Critical);
        assert_eq!(finalized.frame_count, 40);
        assert_eq!(finalized.clip_path.as_deref(), Some("clip.mp4"));
        assert_eq!(finalized.person_images, vec!["p1.jpg".to_string()]);

        let end = finalized.end_ts.unwrap();
        let duration = finalized.duration_seconds.unwrap();
        let expected = (end - finalized.start_ts).num_milliseconds() as f64 / 1000.0;
        assert!((duration - expected).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_finalize_without_clip_keeps_event() {
        let repo = repo().await;
        let event = repo.create(new_event("s1", 0.7)).await.unwrap();

        let mut f = finalization(vec![0.7, 0.72]);
        f.clip_path = None;
        f.clip_duration = None;
        f.thumbnail_path = None;
        let finalized = repo.finalize(&event.id, f).await.unwrap();

        assert!(finalized.clip_path.is_none());
        assert!(finalized.end_ts.is_some());
    }

    #[tokio::test]
    async fn test_review_transition_then_terminal() {
        let repo = repo().await;
        let event = repo.create(new_event("s1", 0.8)).await.unwrap();

        let confirmed = repo
            .update_status(
                &event.id,
                EventStatus::Confirmed,
                Some("operator".to_string()),
                Some("verified".to_string()),
            )
            .await
            .unwrap();
        assert_eq!(confirmed.status, EventStatus::Confirmed);
        assert_eq!(confirmed.reviewed_by.as_deref(), Some("operator"));
        assert!(confirmed.reviewed_at.is_some());

        // Second review is rejected: non-PENDING is terminal
        let err = repo
            .update_status(&event.id, EventStatus::Dismissed, None, None)
            .await;
        assert!(matches!(err, Err(RepositoryError::AlreadyReviewed { .. })));
    }

    #[tokio::test]
    async fn test_list_filters_and_pagination() {
        let repo = repo().await;
        for _ in 0..3 {
            repo.create(new_event("s1", 0.8)).await.unwrap();
        }
        let other = repo.create(new_event("s2", 0.9)).await.unwrap();
        repo.update_status(&other.id, EventStatus::Dismissed, None, None)
            .await
            .unwrap();

        let all = repo.list(EventFilter::default()).await.unwrap();
        assert_eq!(all.len(), 4);

        let s1_only = repo
            .list(EventFilter {
                stream_id: Some("s1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(s1_only.len(), 3);

        let pending = repo
            .list(EventFilter {
                status: Some(EventStatus::Pending),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(pending.len(), 3);

        let paged = repo
            .list(EventFilter {
                limit: Some(2),
                offset: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(paged.len(), 2);

        assert_eq!(repo.count(&EventFilter::default()).await.unwrap(), 4);
        assert_eq!(
            repo.count(&EventFilter {
                status: Some(EventStatus::Dismissed),
                ..Default::default()
            })
            .await
            .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_list_time_window_filters() {
        let repo = repo().await;
        let event = repo.create(new_event("s1", 0.8)).await.unwrap();

        let before = repo
            .list(EventFilter {
                start_before: Some(event.start_ts + ChronoDuration::seconds(10)),
                start_after: Some(event.start_ts - ChronoDuration::seconds(10)),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(before.len(), 1);

        let outside = repo
            .list(EventFilter {
                start_after: Some(event.start_ts + ChronoDuration::seconds(10)),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(outside.is_empty());
    }

    #[tokio::test]
    async fn test_statistics_aggregates() {
        let repo = repo().await;
        let a = repo.create(new_event("s1", 0.99)).await.unwrap();
        repo.create(new_event("s1", 0.5)).await.unwrap();
        repo.create(new_event("s2", 0.8)).await.unwrap();
        repo.update_status(&a.id, EventStatus::Confirmed, None, None)
            .await
            .unwrap();

        let stats = repo.statistics(7).await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_status.get("CONFIRMED"), Some(&1));
        assert_eq!(stats.by_status.get("PENDING"), Some(&2));
        assert_eq!(stats.by_stream.get("s1"), Some(&2));
        assert_eq!(stats.by_stream.get("s2"), Some(&1));
        assert_eq!(stats.by_severity.get("CRITICAL"), Some(&1));
    }

    #[tokio::test]
    async fn test_inference_log_insert() {
        let repo = repo().await;
        repo.log_inference(InferenceLogEntry {
            stream_id: "s1".to_string(),
            timestamp: Utc::now(),
            violence_score: 0.4,
            non_violence_score: 0.6,
            inference_ms: 12.0,
            frame_number: 160,
            window_start: Utc::now(),
            window_end: Utc::now(),
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_missing_event_errors() {
        let repo = repo().await;
        assert!(matches!(
            repo.get_by_id("nope").await,
            Err(RepositoryError::EventNotFound { .. })
        ));
        assert!(repo
            .finalize("nope", finalization(vec![0.5]))
            .await
            .is_err());
    }
}
