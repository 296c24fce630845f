//! PostgreSQL usage store
//!
//! Rows live in `image_usage_events`. The unique index over the dedup key
//! columns is what makes inserts idempotent: a conflicting insert is a no-op
//! and reported as [`InsertOutcome::Duplicate`].

use crate::error::StoreError;
use crate::models::{format_timestamp, parse_timestamp, ImageUsageEvent};
use crate::usage_trait::{InsertOutcome, UsageStoreTrait};
use sqlx::postgres::PgPoolOptions;
use sqlx::prelude::FromRow;
use sqlx::PgPool;
use std::time::Duration;
use tracing::debug;

/// Table layout expected by [`PgUsageStore`].
///
/// Not applied by the store; operators create the table out of band.
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS image_usage_events (
    id          BIGSERIAL PRIMARY KEY,
    pod         TEXT NOT NULL,
    container   TEXT NOT NULL,
    image       TEXT NOT NULL,
    image_id    TEXT NOT NULL,
    namespace   TEXT NOT NULL,
    started_at  TEXT NOT NULL,
    deleted_at  TEXT NOT NULL DEFAULT '',
    event_kind  TEXT NOT NULL,
    UNIQUE (namespace, pod, container, started_at, event_kind)
)";

const INSERT_EVENT: &str = r"
INSERT INTO image_usage_events
    (pod, container, image, image_id, namespace, started_at, deleted_at, event_kind)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
ON CONFLICT (namespace, pod, container, started_at, event_kind) DO NOTHING";

const SELECT_EVENTS: &str = r"
SELECT pod, container, image, image_id, namespace, started_at, deleted_at
FROM image_usage_events
ORDER BY id";

/// Database row representation of an image usage event.
#[derive(Debug, FromRow)]
struct EventRow {
    pod: String,
    container: String,
    image: String,
    image_id: String,
    namespace: String,
    started_at: String,
    deleted_at: String,
}

impl TryFrom<EventRow> for ImageUsageEvent {
    type Error = StoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let started_at = parse_timestamp(&row.started_at).map_err(|e| {
            StoreError::InvalidRecord(format!("started_at {:?}: {}", row.started_at, e))
        })?;
        let deleted_at = if row.deleted_at.is_empty() {
            None
        } else {
            Some(parse_timestamp(&row.deleted_at).map_err(|e| {
                StoreError::InvalidRecord(format!("deleted_at {:?}: {}", row.deleted_at, e))
            })?)
        };

        Ok(ImageUsageEvent {
            pod: row.pod,
            container: row.container,
            image: row.image,
            image_id: row.image_id,
            namespace: row.namespace,
            started_at,
            deleted_at,
        })
    }
}

/// PostgreSQL-backed usage store
#[derive(Debug, Clone)]
pub struct PgUsageStore {
    pool: PgPool,
}

impl PgUsageStore {
    /// Connect to the database at `url`.
    ///
    /// # Arguments
    /// * `url` - PostgreSQL connection URI (e.g., "postgres://user:pass@db:5432/images")
    /// * `max_connections` - Upper bound of the connection pool
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await?;

        Ok(Self { pool })
    }

    /// Underlying connection pool
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl UsageStoreTrait for PgUsageStore {
    async fn insert(&self, event: &ImageUsageEvent) -> Result<InsertOutcome, StoreError> {
        let started_at = format_timestamp(&event.started_at);
        let deleted_at = event
            .deleted_at
            .as_ref()
            .map(format_timestamp)
            .unwrap_or_default();

        let result = sqlx::query(INSERT_EVENT)
            .bind(&event.pod)
            .bind(&event.container)
            .bind(&event.image)
            .bind(&event.image_id)
            .bind(&event.namespace)
            .bind(&started_at)
            .bind(&deleted_at)
            .bind(event.kind().as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            debug!("Skipped duplicate event {}", event.dedup_key());
            Ok(InsertOutcome::Duplicate)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }

    async fn list(&self) -> Result<Vec<ImageUsageEvent>, StoreError> {
        let rows: Vec<EventRow> = sqlx::query_as(SELECT_EVENTS).fetch_all(&self.pool).await?;
        rows.into_iter().map(ImageUsageEvent::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(deleted_at: &str) -> EventRow {
        EventRow {
            pod: "web-1".to_string(),
            container: "app".to_string(),
            image: "nginx:1.25".to_string(),
            image_id: "sha256:abc".to_string(),
            namespace: "default".to_string(),
            started_at: "2024-01-01T00:00:00Z".to_string(),
            deleted_at: deleted_at.to_string(),
        }
    }

    #[test]
    fn test_row_with_empty_deleted_at_is_added_event() {
        let event = ImageUsageEvent::try_from(row("")).unwrap();
        assert_eq!(event.deleted_at, None);
        assert_eq!(format_timestamp(&event.started_at), "2024-01-01T00:00:00Z");
    }

    #[test]
    fn test_row_with_deleted_at_is_deleted_event() {
        let event = ImageUsageEvent::try_from(row("2024-01-01T01:00:00Z")).unwrap();
        assert_eq!(
            event.deleted_at.as_ref().map(format_timestamp).as_deref(),
            Some("2024-01-01T01:00:00Z")
        );
    }

    #[test]
    fn test_row_with_garbage_timestamp_is_invalid() {
        let err = ImageUsageEvent::try_from(row("not-a-time")).unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord(_)));
    }
}
