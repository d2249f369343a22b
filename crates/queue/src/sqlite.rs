//! SQLite-backed job store.
//!
//! One table per [`QueueNamespace`]. Timestamps are stored as UTC
//! milliseconds so range filters compare integers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};
use tracing::instrument;

use optti_core::{EntityId, JobId};

use crate::namespace::QueueNamespace;
use crate::store::{JobStore, StoreError};
use crate::types::{Job, JobStatus, JobTransition, NewJob, StatusCounts};

const COLUMNS: &str =
    "id, entity_id, status, attempts, source, last_error, enqueued_at, locked_at, completed_at";

/// Ids bound per `DELETE ... IN (...)`; SQLite caps bound variables at 32766.
const DELETE_CHUNK: usize = 500;

/// SQLite job store.
///
/// Cheap to clone; the pool is shared.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
    table: String,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool, namespace: &QueueNamespace) -> Self {
        Self {
            pool,
            table: namespace.table_name(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the jobs table and its indexes if missing.
    #[instrument(skip(self), fields(table = %self.table), err)]
    pub async fn create_table(&self) -> Result<(), StoreError> {
        let table = &self.table;
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_id     INTEGER NOT NULL,
                status        TEXT NOT NULL DEFAULT 'pending',
                attempts      INTEGER NOT NULL DEFAULT 0,
                source        TEXT NOT NULL DEFAULT 'auto',
                last_error    TEXT NULL,
                enqueued_at   INTEGER NOT NULL,
                locked_at     INTEGER NULL,
                completed_at  INTEGER NULL
            )
            "#
        ))
        .execute(&self.pool)
        .await?;

        for (suffix, columns) in [
            ("status", "status"),
            ("entity_status", "entity_id, status"),
            ("enqueued", "enqueued_at"),
            ("locked", "locked_at"),
        ] {
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS {table}_{suffix} ON {table} ({columns})"
            ))
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: i64,
    entity_id: i64,
    status: String,
    attempts: i64,
    source: String,
    last_error: Option<String>,
    enqueued_at: i64,
    locked_at: Option<i64>,
    completed_at: Option<i64>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| StoreError::CorruptRow { id: row.id, reason };
        let entity_id = EntityId::new(row.entity_id)
            .ok_or_else(|| corrupt(format!("entity_id {} is not positive", row.entity_id)))?;
        let status = JobStatus::parse(&row.status)
            .ok_or_else(|| corrupt(format!("unknown status {:?}", row.status)))?;
        let attempts = u32::try_from(row.attempts)
            .map_err(|_| corrupt(format!("attempts {} out of range", row.attempts)))?;
        let enqueued_at =
            from_millis(row.enqueued_at).ok_or_else(|| corrupt("enqueued_at".into()))?;
        let locked_at = optional_millis(row.locked_at).map_err(|_| corrupt("locked_at".into()))?;
        let completed_at =
            optional_millis(row.completed_at).map_err(|_| corrupt("completed_at".into()))?;

        Ok(Job {
            id: JobId::new(row.id),
            entity_id,
            status,
            attempts,
            source: row.source,
            last_error: row.last_error,
            enqueued_at,
            locked_at,
            completed_at,
        })
    }
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

fn optional_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>, ()> {
    match ms {
        None => Ok(None),
        Some(ms) => from_millis(ms).map(Some).ok_or(()),
    }
}

fn into_jobs(rows: Vec<JobRow>) -> Result<Vec<Job>, StoreError> {
    rows.into_iter().map(Job::try_from).collect()
}

#[async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(skip(self), fields(table = %self.table), err)]
    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM {} WHERE id = ?1", self.table);
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Job::try_from).transpose()
    }

    #[instrument(skip(self), fields(table = %self.table), err)]
    async fn find_active_for_entity(
        &self,
        entity_id: EntityId,
    ) -> Result<Option<JobId>, StoreError> {
        let sql = format!(
            "SELECT id FROM {} WHERE entity_id = ?1 AND status IN ('pending', 'processing') \
             ORDER BY id ASC LIMIT 1",
            self.table
        );
        let id: Option<i64> = sqlx::query_scalar(&sql)
            .bind(entity_id.get())
            .fetch_optional(&self.pool)
            .await?;
        Ok(id.map(JobId::new))
    }

    #[instrument(skip(self, job), fields(table = %self.table, entity_id = %job.entity_id), err)]
    async fn insert(&self, job: NewJob) -> Result<JobId, StoreError> {
        let sql = format!(
            "INSERT INTO {} (entity_id, status, attempts, source, enqueued_at) \
             VALUES (?1, 'pending', 0, ?2, ?3)",
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(job.entity_id.get())
            .bind(&job.source)
            .bind(job.enqueued_at.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(JobId::new(result.last_insert_rowid()))
    }

    #[instrument(
        skip(self, entity_ids),
        fields(table = %self.table, count = entity_ids.len()),
        err
    )]
    async fn delete_for_entities(&self, entity_ids: &[EntityId]) -> Result<u64, StoreError> {
        let mut deleted = 0;
        for chunk in entity_ids.chunks(DELETE_CHUNK) {
            let mut builder = QueryBuilder::<Sqlite>::new(format!(
                "DELETE FROM {} WHERE entity_id IN (",
                self.table
            ));
            {
                let mut separated = builder.separated(", ");
                for id in chunk {
                    separated.push_bind(id.get());
                }
            }
            builder.push(")");
            deleted += builder.build().execute(&self.pool).await?.rows_affected();
        }
        Ok(deleted)
    }

    #[instrument(skip(self), fields(table = %self.table), err)]
    async fn pending_candidates(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM {} WHERE status = 'pending' ORDER BY id ASC LIMIT ?1",
            self.table
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        into_jobs(rows)
    }

    #[instrument(skip(self), fields(table = %self.table), err)]
    async fn try_claim(&self, id: JobId, locked_at: DateTime<Utc>) -> Result<bool, StoreError> {
        let sql = format!(
            "UPDATE {} SET status = 'processing', locked_at = ?1, attempts = attempts + 1 \
             WHERE id = ?2 AND status = 'pending'",
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(locked_at.timestamp_millis())
            .bind(id.get())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(
        skip(self, transition),
        fields(table = %self.table, status = %transition.status),
        err
    )]
    async fn apply_transition(
        &self,
        id: JobId,
        transition: JobTransition,
    ) -> Result<bool, StoreError> {
        let sql = format!(
            "UPDATE {} SET status = ?1, locked_at = NULL, last_error = ?2, \
             completed_at = COALESCE(?3, completed_at) WHERE id = ?4",
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(transition.status.as_str())
            .bind(transition.last_error)
            .bind(transition.completed_at.map(|at| at.timestamp_millis()))
            .bind(id.get())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(table = %self.table), err)]
    async fn requeue_failed(&self) -> Result<u64, StoreError> {
        let sql = format!(
            "UPDATE {} SET status = 'pending', locked_at = NULL, last_error = NULL \
             WHERE status = 'failed'",
            self.table
        );
        let result = sqlx::query(&sql).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(table = %self.table), err)]
    async fn release_stale(&self, locked_before: DateTime<Utc>) -> Result<u64, StoreError> {
        let sql = format!(
            "UPDATE {} SET status = 'pending', locked_at = NULL \
             WHERE status = 'processing' AND locked_at IS NOT NULL AND locked_at < ?1",
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(locked_before.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(table = %self.table), err)]
    async fn delete_completed(
        &self,
        completed_before: Option<DateTime<Utc>>,
    ) -> Result<u64, StoreError> {
        let result = match completed_before {
            None => {
                let sql = format!("DELETE FROM {} WHERE status = 'completed'", self.table);
                sqlx::query(&sql).execute(&self.pool).await?
            }
            Some(cutoff) => {
                let sql = format!(
                    "DELETE FROM {} WHERE status = 'completed' AND completed_at < ?1",
                    self.table
                );
                sqlx::query(&sql)
                    .bind(cutoff.timestamp_millis())
                    .execute(&self.pool)
                    .await?
            }
        };
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(table = %self.table), err)]
    async fn status_counts(&self) -> Result<StatusCounts, StoreError> {
        let sql = format!("SELECT status, COUNT(*) FROM {} GROUP BY status", self.table);
        let rows: Vec<(String, i64)> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        let mut counts = StatusCounts::default();
        for (status, total) in rows {
            match JobStatus::parse(&status) {
                Some(status) => counts.add(status, total.max(0) as u64),
                None => tracing::warn!(status = %status, total, "ignoring unknown job status"),
            }
        }
        Ok(counts)
    }

    #[instrument(skip(self), fields(table = %self.table), err)]
    async fn count_completed_since(&self, since: DateTime<Utc>) -> Result<u64, StoreError> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE status = 'completed' AND completed_at >= ?1",
            self.table
        );
        let total: i64 = sqlx::query_scalar(&sql)
            .bind(since.timestamp_millis())
            .fetch_one(&self.pool)
            .await?;
        Ok(total.max(0) as u64)
    }

    #[instrument(skip(self), fields(table = %self.table), err)]
    async fn recent(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let rows = match status {
            None => {
                let sql = format!(
                    "SELECT {COLUMNS} FROM {} ORDER BY id DESC LIMIT ?1",
                    self.table
                );
                sqlx::query_as::<_, JobRow>(&sql)
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
            Some(status) => {
                let sql = format!(
                    "SELECT {COLUMNS} FROM {} WHERE status = ?1 ORDER BY id DESC LIMIT ?2",
                    self.table
                );
                sqlx::query_as::<_, JobRow>(&sql)
                    .bind(status.as_str())
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        into_jobs(rows)
    }
}
