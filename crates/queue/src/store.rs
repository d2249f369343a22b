//! Job persistence adapter.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use optti_core::{EntityId, JobId};

use crate::types::{Job, JobStatus, JobTransition, NewJob, StatusCounts};

/// Row-level primitives the [`Queue`](crate::Queue) is built on.
///
/// Implementations only need single-row conditional updates; no
/// multi-row transactions are assumed.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Get a job by ID.
    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Oldest pending or processing job for `entity_id`, if any.
    async fn find_active_for_entity(&self, entity_id: EntityId)
    -> Result<Option<JobId>, StoreError>;

    /// Insert a `pending` row and return its id.
    async fn insert(&self, job: NewJob) -> Result<JobId, StoreError>;

    /// Delete every row (any status) for the given entities.
    async fn delete_for_entities(&self, entity_ids: &[EntityId]) -> Result<u64, StoreError>;

    /// Up to `limit` pending rows, ascending id.
    async fn pending_candidates(&self, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// Conditional `pending -> processing` update guarded by id and status.
    ///
    /// Increments `attempts` and stamps `locked_at`. Returns `false` when
    /// the row is no longer pending.
    async fn try_claim(&self, id: JobId, locked_at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Unconditional update by id. Returns `false` when no row matched.
    async fn apply_transition(
        &self,
        id: JobId,
        transition: JobTransition,
    ) -> Result<bool, StoreError>;

    /// `failed -> pending` for every failed row, clearing lock and error.
    async fn requeue_failed(&self) -> Result<u64, StoreError>;

    /// `processing -> pending` for rows locked before `locked_before`.
    async fn release_stale(&self, locked_before: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Delete completed rows; all of them when `completed_before` is `None`.
    async fn delete_completed(
        &self,
        completed_before: Option<DateTime<Utc>>,
    ) -> Result<u64, StoreError>;

    async fn status_counts(&self) -> Result<StatusCounts, StoreError>;

    async fn count_completed_since(&self, since: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Newest-first listing, optionally filtered by status.
    async fn recent(&self, status: Option<JobStatus>, limit: usize)
    -> Result<Vec<Job>, StoreError>;
}

/// Persistence failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt job row {id}: {reason}")]
    CorruptRow { id: i64, reason: String },
    #[error("storage error: {0}")]
    Storage(String),
}

/// In-memory job store (tests and local development).
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    last_id: i64,
    jobs: BTreeMap<JobId, Job>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Snapshot of every row, ascending id.
    pub fn all(&self) -> Result<Vec<Job>, StoreError> {
        Ok(self.lock()?.jobs.values().cloned().collect())
    }

    /// Overwrite a row as-is. Lets tests age locks and completions.
    pub fn put(&self, job: Job) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state.last_id = state.last_id.max(job.id.get());
        state.jobs.insert(job.id, job);
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Storage("job store lock poisoned".into()))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.lock()?.jobs.get(&id).cloned())
    }

    async fn find_active_for_entity(
        &self,
        entity_id: EntityId,
    ) -> Result<Option<JobId>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .jobs
            .values()
            .find(|j| j.entity_id == entity_id && !j.status.is_terminal())
            .map(|j| j.id))
    }

    async fn insert(&self, job: NewJob) -> Result<JobId, StoreError> {
        let mut state = self.lock()?;
        state.last_id += 1;
        let id = JobId::new(state.last_id);
        state.jobs.insert(
            id,
            Job {
                id,
                entity_id: job.entity_id,
                status: JobStatus::Pending,
                attempts: 0,
                source: job.source,
                last_error: None,
                enqueued_at: job.enqueued_at,
                locked_at: None,
                completed_at: None,
            },
        );
        Ok(id)
    }

    async fn delete_for_entities(&self, entity_ids: &[EntityId]) -> Result<u64, StoreError> {
        let targets: HashSet<EntityId> = entity_ids.iter().copied().collect();
        let mut state = self.lock()?;
        let before = state.jobs.len();
        state.jobs.retain(|_, j| !targets.contains(&j.entity_id));
        Ok((before - state.jobs.len()) as u64)
    }

    async fn pending_candidates(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn try_claim(&self, id: JobId, locked_at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        match state.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.mark_claimed(locked_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn apply_transition(
        &self,
        id: JobId,
        transition: JobTransition,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        match state.jobs.get_mut(&id) {
            Some(job) => {
                job.apply(&transition);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn requeue_failed(&self) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        let reset = JobTransition::reset();
        let mut count = 0;
        for job in state.jobs.values_mut() {
            if job.status == JobStatus::Failed {
                job.apply(&reset);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn release_stale(&self, locked_before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        let mut count = 0;
        for job in state.jobs.values_mut() {
            let stale = job.status == JobStatus::Processing
                && job.locked_at.is_some_and(|at| at < locked_before);
            if stale {
                job.status = JobStatus::Pending;
                job.locked_at = None;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn delete_completed(
        &self,
        completed_before: Option<DateTime<Utc>>,
    ) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        let before = state.jobs.len();
        state.jobs.retain(|_, j| {
            let expired = match completed_before {
                None => true,
                Some(cutoff) => j.completed_at.is_some_and(|at| at < cutoff),
            };
            !(j.status == JobStatus::Completed && expired)
        });
        Ok((before - state.jobs.len()) as u64)
    }

    async fn status_counts(&self) -> Result<StatusCounts, StoreError> {
        let state = self.lock()?;
        let mut counts = StatusCounts::default();
        for job in state.jobs.values() {
            counts.add(job.status, 1);
        }
        Ok(counts)
    }

    async fn count_completed_since(&self, since: DateTime<Utc>) -> Result<u64, StoreError> {
        let state = self.lock()?;
        Ok(state
            .jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Completed && j.completed_at.is_some_and(|at| at >= since)
            })
            .count() as u64)
    }

    async fn recent(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .jobs
            .values()
            .rev()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        (**self).get(id).await
    }

    async fn find_active_for_entity(
        &self,
        entity_id: EntityId,
    ) -> Result<Option<JobId>, StoreError> {
        (**self).find_active_for_entity(entity_id).await
    }

    async fn insert(&self, job: NewJob) -> Result<JobId, StoreError> {
        (**self).insert(job).await
    }

    async fn delete_for_entities(&self, entity_ids: &[EntityId]) -> Result<u64, StoreError> {
        (**self).delete_for_entities(entity_ids).await
    }

    async fn pending_candidates(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        (**self).pending_candidates(limit).await
    }

    async fn try_claim(&self, id: JobId, locked_at: DateTime<Utc>) -> Result<bool, StoreError> {
        (**self).try_claim(id, locked_at).await
    }

    async fn apply_transition(
        &self,
        id: JobId,
        transition: JobTransition,
    ) -> Result<bool, StoreError> {
        (**self).apply_transition(id, transition).await
    }

    async fn requeue_failed(&self) -> Result<u64, StoreError> {
        (**self).requeue_failed().await
    }

    async fn release_stale(&self, locked_before: DateTime<Utc>) -> Result<u64, StoreError> {
        (**self).release_stale(locked_before).await
    }

    async fn delete_completed(
        &self,
        completed_before: Option<DateTime<Utc>>,
    ) -> Result<u64, StoreError> {
        (**self).delete_completed(completed_before).await
    }

    async fn status_counts(&self) -> Result<StatusCounts, StoreError> {
        (**self).status_counts().await
    }

    async fn count_completed_since(&self, since: DateTime<Utc>) -> Result<u64, StoreError> {
        (**self).count_completed_since(since).await
    }

    async fn recent(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        (**self).recent(status, limit).await
    }
}
