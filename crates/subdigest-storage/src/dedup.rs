//! Processed-post markers keyed by post identifier.
//!
//! `create_if_absent` is the only concurrency primitive the pipeline relies on:
//! it must be atomic per key so that overlapping runs racing on the same new
//! post see exactly one winner. No operation here spans more than one key.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use subdigest_core::ProcessedMarker;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum DedupStoreError {
    #[error("dedup store query failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("dedup store migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("no marker exists for {0}")]
    MissingMarker(String),
}

#[async_trait]
pub trait DedupStore: Send + Sync {
    async fn lookup(&self, id: &str) -> Result<Option<ProcessedMarker>, DedupStoreError>;

    async fn lookup_many(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, ProcessedMarker>, DedupStoreError> {
        let mut found = HashMap::new();
        for id in ids {
            if let Some(marker) = self.lookup(id).await? {
                found.insert(id.clone(), marker);
            }
        }
        Ok(found)
    }

    /// Returns `true` only if this call created the marker.
    async fn create_if_absent(&self, marker: &ProcessedMarker) -> Result<bool, DedupStoreError>;

    /// Overwrites `comment_count` and `last_processed_at`. The stored count never decreases.
    async fn update(
        &self,
        id: &str,
        comment_count: u32,
        at: DateTime<Utc>,
    ) -> Result<(), DedupStoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryDedupStore {
    markers: Mutex<HashMap<String, ProcessedMarker>>,
}

impl MemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> HashMap<String, ProcessedMarker> {
        self.markers.lock().await.clone()
    }

    pub async fn insert(&self, marker: ProcessedMarker) {
        self.markers.lock().await.insert(marker.id.clone(), marker);
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn lookup(&self, id: &str) -> Result<Option<ProcessedMarker>, DedupStoreError> {
        Ok(self.markers.lock().await.get(id).cloned())
    }

    async fn create_if_absent(&self, marker: &ProcessedMarker) -> Result<bool, DedupStoreError> {
        let mut markers = self.markers.lock().await;
        if markers.contains_key(&marker.id) {
            return Ok(false);
        }
        markers.insert(marker.id.clone(), marker.clone());
        Ok(true)
    }

    async fn update(
        &self,
        id: &str,
        comment_count: u32,
        at: DateTime<Utc>,
    ) -> Result<(), DedupStoreError> {
        let mut markers = self.markers.lock().await;
        let marker = markers
            .get_mut(id)
            .ok_or_else(|| DedupStoreError::MissingMarker(id.to_string()))?;
        marker.comment_count = marker.comment_count.max(comment_count);
        marker.last_processed_at = at;
        Ok(())
    }
}

/// Postgres-backed markers in the `processed_posts` table.
#[derive(Debug, Clone)]
pub struct PgDedupStore {
    pool: PgPool,
}

impl PgDedupStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, DedupStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), DedupStoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    fn marker_from_row(row: &PgRow) -> Result<ProcessedMarker, sqlx::Error> {
        let count: i64 = row.try_get("comment_count")?;
        Ok(ProcessedMarker {
            id: row.try_get("post_id")?,
            first_processed_at: row.try_get("first_processed_at")?,
            last_processed_at: row.try_get("last_processed_at")?,
            comment_count: u32::try_from(count).unwrap_or(u32::MAX),
        })
    }
}

#[async_trait]
impl DedupStore for PgDedupStore {
    async fn lookup(&self, id: &str) -> Result<Option<ProcessedMarker>, DedupStoreError> {
        let row = sqlx::query(
            r#"
            SELECT post_id, first_processed_at, last_processed_at, comment_count
              FROM processed_posts
             WHERE post_id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(Self::marker_from_row).transpose()?)
    }

    async fn lookup_many(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, ProcessedMarker>, DedupStoreError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT post_id, first_processed_at, last_processed_at, comment_count
              FROM processed_posts
             WHERE post_id = ANY($1)
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        let mut found = HashMap::with_capacity(rows.len());
        for row in &rows {
            let marker = Self::marker_from_row(row)?;
            found.insert(marker.id.clone(), marker);
        }
        Ok(found)
    }

    async fn create_if_absent(&self, marker: &ProcessedMarker) -> Result<bool, DedupStoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_posts (post_id, first_processed_at, last_processed_at, comment_count)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (post_id) DO NOTHING
            "#,
        )
        .bind(&marker.id)
        .bind(marker.first_processed_at)
        .bind(marker.last_processed_at)
        .bind(i64::from(marker.comment_count))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update(
        &self,
        id: &str,
        comment_count: u32,
        at: DateTime<Utc>,
    ) -> Result<(), DedupStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE processed_posts
               SET comment_count = GREATEST(comment_count, $2),
                   last_processed_at = $3
             WHERE post_id = $1
            "#,
        )
        .bind(id)
        .bind(i64::from(comment_count))
        .bind(at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DedupStoreError::MissingMarker(id.to_string()));
        }
        Ok(())
    }
}
