//! Queue policy on top of a [`JobStore`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, trace};

use optti_core::{EntityId, JobId, sanitize_key, trim_words};

use crate::namespace::QueueNamespace;
use crate::scheduler::DeferredScheduler;
use crate::store::{JobStore, StoreError};
use crate::types::{Job, JobStatus, JobTransition, NewJob, QueueStats};

/// Source tag whose enqueue first purges earlier rows for the same entities.
pub const REGENERATE_SOURCE: &str = "bulk-regenerate";
pub const DEFAULT_SOURCE: &str = "auto";

pub const DEFAULT_CLAIM_LIMIT: usize = 5;
pub const DEFAULT_STALE_TIMEOUT: Duration = Duration::from_secs(600);
pub const MIN_STALE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_SCHEDULE_DELAY: Duration = Duration::from_secs(30);
pub const MIN_SCHEDULE_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_PURGE_AGE: Duration = Duration::from_secs(86_400);
pub const MIN_PURGE_AGE: Duration = Duration::from_secs(300);
pub const DEFAULT_FAILURE_LIMIT: usize = 10;
pub const DEFAULT_RECENT_LIMIT: usize = 20;

const CLAIM_OVERFETCH: usize = 3;
const LAST_ERROR_WORDS: usize = 120;
const RECENT_WINDOW: Duration = Duration::from_secs(86_400);
const MAX_AGE: Duration = Duration::from_secs(100 * 365 * 86_400);

/// What [`Queue::enqueue_entity`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new pending row was inserted.
    Created(JobId),
    /// A pending or processing row already existed.
    AlreadyQueued(JobId),
    /// The entity id was not positive.
    Rejected,
}

/// A durable job queue.
///
/// Owns every mutation of its rows. Invalid input is reported through
/// `false`/`0` return values; only persistence failures are errors.
pub struct Queue<S> {
    store: S,
    scheduler: Arc<dyn DeferredScheduler>,
    namespace: QueueNamespace,
}

impl<S: JobStore> Queue<S> {
    pub fn new(
        store: S,
        scheduler: Arc<dyn DeferredScheduler>,
        namespace: QueueNamespace,
    ) -> Self {
        Self {
            store,
            scheduler,
            namespace,
        }
    }

    pub fn namespace(&self) -> &QueueNamespace {
        &self.namespace
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Enqueue one entity. Returns `false` only for a non-positive id.
    pub async fn enqueue(&self, entity_id: i64, source: &str) -> Result<bool, StoreError> {
        let outcome = self.enqueue_entity(entity_id, source).await?;
        Ok(outcome != EnqueueOutcome::Rejected)
    }

    /// Enqueue one entity, reporting whether a row was created.
    ///
    /// An existing pending/processing row for the entity suppresses the
    /// insert. The drain trigger is armed either way.
    #[instrument(skip(self), fields(queue = %self.namespace))]
    pub async fn enqueue_entity(
        &self,
        entity_id: i64,
        source: &str,
    ) -> Result<EnqueueOutcome, StoreError> {
        let Some(entity) = EntityId::new(entity_id) else {
            debug!(entity_id, "rejecting non-positive entity id");
            return Ok(EnqueueOutcome::Rejected);
        };

        if let Some(existing) = self.store.find_active_for_entity(entity).await? {
            trace!(job_id = %existing, "entity already queued");
            self.schedule_processing(DEFAULT_SCHEDULE_DELAY);
            return Ok(EnqueueOutcome::AlreadyQueued(existing));
        }

        let mut source = sanitize_key(source);
        if source.is_empty() {
            source = DEFAULT_SOURCE.to_string();
        }
        let id = self
            .store
            .insert(NewJob {
                entity_id: entity,
                source,
                enqueued_at: Utc::now(),
            })
            .await?;
        debug!(job_id = %id, entity_id = %entity, "enqueued job");
        self.schedule_processing(DEFAULT_SCHEDULE_DELAY);
        Ok(EnqueueOutcome::Created(id))
    }

    /// Enqueue many entities; returns how many rows were created.
    ///
    /// With [`REGENERATE_SOURCE`] every existing row for those entities is
    /// removed first, so each ends up with exactly one fresh pending row.
    #[instrument(skip(self, entity_ids), fields(queue = %self.namespace, count = entity_ids.len()))]
    pub async fn enqueue_many(
        &self,
        entity_ids: &[i64],
        source: &str,
    ) -> Result<usize, StoreError> {
        if source == REGENERATE_SOURCE {
            let purged = self.clear_for_entities(entity_ids).await?;
            if purged > 0 {
                debug!(purged, "purged previous jobs before regenerate");
            }
        }

        let mut created = 0;
        for &entity_id in entity_ids {
            if let EnqueueOutcome::Created(_) = self.enqueue_entity(entity_id, source).await? {
                created += 1;
            }
        }
        Ok(created)
    }

    /// Delete every row, any status, for the given entities.
    pub async fn clear_for_entities(&self, entity_ids: &[i64]) -> Result<u64, StoreError> {
        let entities: Vec<EntityId> = entity_ids
            .iter()
            .copied()
            .filter_map(EntityId::new)
            .collect();
        if entities.is_empty() {
            return Ok(0);
        }
        self.store.delete_for_entities(&entities).await
    }

    /// Claim up to `limit` pending jobs, oldest first.
    ///
    /// Candidates are over-fetched so rows lost to concurrent claimers are
    /// absorbed. The returned jobs already reflect the claim.
    #[instrument(skip(self), fields(queue = %self.namespace))]
    pub async fn claim_batch(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        let limit = limit.max(1);
        let candidates = self
            .store
            .pending_candidates(limit.saturating_mul(CLAIM_OVERFETCH))
            .await?;

        let mut claimed = Vec::with_capacity(limit.min(candidates.len()));
        for mut job in candidates {
            let now = Utc::now();
            if self.store.try_claim(job.id, now).await? {
                job.mark_claimed(now);
                claimed.push(job);
                if claimed.len() >= limit {
                    break;
                }
            } else {
                trace!(job_id = %job.id, "job claimed by another worker");
            }
        }
        debug!(claimed = claimed.len(), "claimed batch");
        Ok(claimed)
    }

    pub async fn mark_complete(&self, job_id: JobId) -> Result<bool, StoreError> {
        self.store
            .apply_transition(job_id, JobTransition::completed(Utc::now()))
            .await
    }

    /// Back to `pending` after a transient failure. Attempts are not touched.
    pub async fn mark_retry(&self, job_id: JobId, message: &str) -> Result<bool, StoreError> {
        self.store
            .apply_transition(job_id, JobTransition::retry(truncate_error(message)))
            .await
    }

    /// Force any job back to `pending`, clearing lock and error.
    pub async fn retry_job(&self, job_id: JobId) -> Result<bool, StoreError> {
        self.store.apply_transition(job_id, JobTransition::reset()).await
    }

    /// Terminal failure; only `retry_job`/`retry_failed` resume it.
    pub async fn mark_failed(&self, job_id: JobId, message: &str) -> Result<bool, StoreError> {
        self.store
            .apply_transition(job_id, JobTransition::failed(truncate_error(message)))
            .await
    }

    /// Move every failed job back to `pending`.
    pub async fn retry_failed(&self) -> Result<u64, StoreError> {
        let count = self.store.requeue_failed().await?;
        if count > 0 {
            info!(queue = %self.namespace, count, "requeued failed jobs");
        }
        Ok(count)
    }

    /// Release `processing` jobs locked longer than `timeout` (at least 60s).
    pub async fn reset_stale(&self, timeout: Duration) -> Result<u64, StoreError> {
        let cutoff = cutoff(Utc::now(), timeout.max(MIN_STALE_TIMEOUT));
        let released = self.store.release_stale(cutoff).await?;
        if released > 0 {
            info!(queue = %self.namespace, released, "released stale jobs");
        }
        Ok(released)
    }

    /// Delete completed jobs older than `age`; all of them when `age` is zero.
    pub async fn clear_completed(&self, age: Duration) -> Result<u64, StoreError> {
        let before = (!age.is_zero()).then(|| cutoff(Utc::now(), age));
        self.store.delete_completed(before).await
    }

    /// Retention cleanup: delete completed jobs older than `age` (at least 300s).
    pub async fn purge_completed(&self, age: Duration) -> Result<u64, StoreError> {
        self.clear_completed(age.max(MIN_PURGE_AGE)).await
    }

    pub async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        self.store.get(job_id).await
    }

    pub async fn get_stats(&self) -> Result<QueueStats, StoreError> {
        let counts = self.store.status_counts().await?;
        let recent = self
            .store
            .count_completed_since(cutoff(Utc::now(), RECENT_WINDOW))
            .await?;
        Ok(QueueStats::from_counts(counts, recent))
    }

    /// Newest jobs first.
    pub async fn get_recent(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        self.store.recent(None, limit.max(1)).await
    }

    /// Newest failed jobs first.
    pub async fn get_recent_failures(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        self.store.recent(Some(JobStatus::Failed), limit.max(1)).await
    }

    pub async fn get_failures(&self) -> Result<Vec<Job>, StoreError> {
        self.get_recent_failures(DEFAULT_FAILURE_LIMIT).await
    }

    /// Arm the drain trigger no sooner than `max(5s, delay)` from now.
    ///
    /// Returns `false` when a trigger is already pending.
    pub fn schedule_processing(&self, delay: Duration) -> bool {
        let delay = delay.max(MIN_SCHEDULE_DELAY);
        let armed = self
            .scheduler
            .schedule_once(delay, &self.namespace.hook_name());
        if armed {
            debug!(
                queue = %self.namespace,
                delay_secs = delay.as_secs(),
                "scheduled queue processing"
            );
        }
        armed
    }
}

fn truncate_error(message: &str) -> String {
    trim_words(message, LAST_ERROR_WORDS, "…")
}

fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    let age = chrono::Duration::seconds(age.min(MAX_AGE).as_secs() as i64);
    now - age
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    use proptest::prelude::*;

    use crate::store::InMemoryJobStore;

    /// Records every arming attempt; never fires.
    #[derive(Default)]
    struct RecordingScheduler {
        armed: Mutex<HashSet<String>>,
        requests: Mutex<Vec<Duration>>,
    }

    impl DeferredScheduler for RecordingScheduler {
        fn schedule_once(&self, delay: Duration, hook: &str) -> bool {
            self.requests.lock().unwrap().push(delay);
            self.armed.lock().unwrap().insert(hook.to_string())
        }

        fn is_scheduled(&self, hook: &str) -> bool {
            self.armed.lock().unwrap().contains(hook)
        }
    }

    fn queue() -> (Queue<Arc<InMemoryJobStore>>, Arc<RecordingScheduler>) {
        let scheduler = Arc::new(RecordingScheduler::default());
        let queue = Queue::new(
            InMemoryJobStore::arc(),
            scheduler.clone(),
            QueueNamespace::new("alt-text"),
        );
        (queue, scheduler)
    }

    async fn active_rows(queue: &Queue<Arc<InMemoryJobStore>>, entity: i64) -> usize {
        queue
            .store()
            .all()
            .unwrap()
            .iter()
            .filter(|j| j.entity_id.get() == entity && !j.status.is_terminal())
            .count()
    }

    #[tokio::test]
    async fn enqueue_rejects_non_positive_ids() {
        let (queue, scheduler) = queue();
        assert!(!queue.enqueue(0, "auto").await.unwrap());
        assert!(!queue.enqueue(-3, "auto").await.unwrap());
        assert!(queue.store().all().unwrap().is_empty());
        assert!(scheduler.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn enqueue_dedups_active_entities_and_still_schedules() {
        let (queue, scheduler) = queue();
        assert!(queue.enqueue(42, "auto").await.unwrap());
        assert!(queue.enqueue(42, "auto").await.unwrap());

        assert_eq!(active_rows(&queue, 42).await, 1);
        assert_eq!(scheduler.requests.lock().unwrap().len(), 2);
        assert!(scheduler.is_scheduled("optti_process_queue_alt-text"));
    }

    #[tokio::test]
    async fn enqueue_sanitizes_source() {
        let (queue, _) = queue();
        queue.enqueue(1, "Bulk Upload!").await.unwrap();
        queue.enqueue(2, "").await.unwrap();
        let jobs = queue.store().all().unwrap();
        assert_eq!(jobs[0].source, "bulkupload");
        assert_eq!(jobs[1].source, "auto");
    }

    #[tokio::test]
    async fn failed_rows_do_not_block_new_enqueue() {
        let (queue, _) = queue();
        queue.enqueue(7, "auto").await.unwrap();
        let job = queue.claim_batch(1).await.unwrap().remove(0);
        queue.mark_failed(job.id, "bad image").await.unwrap();

        assert_eq!(
            queue.enqueue_entity(7, "auto").await.unwrap(),
            EnqueueOutcome::Created(JobId::new(2))
        );
    }

    #[tokio::test]
    async fn enqueue_many_counts_only_new_rows() {
        let (queue, _) = queue();
        queue.enqueue(1, "auto").await.unwrap();
        let created = queue.enqueue_many(&[1, 2, 3, 3, 0], "bulk").await.unwrap();
        assert_eq!(created, 2);
        assert_eq!(queue.store().all().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn regenerate_replaces_existing_rows() {
        let (queue, _) = queue();
        queue.enqueue_many(&[1, 2], "bulk").await.unwrap();
        let claimed = queue.claim_batch(1).await.unwrap();
        assert_eq!(claimed[0].entity_id.get(), 1);

        let created = queue.enqueue_many(&[1, 2, 3], REGENERATE_SOURCE).await.unwrap();
        assert_eq!(created, 3);
        for entity in [1, 2, 3] {
            assert_eq!(active_rows(&queue, entity).await, 1);
        }
        let jobs = queue.store().all().unwrap();
        assert!(jobs.iter().all(|j| j.status == JobStatus::Pending && j.attempts == 0));
        assert!(jobs.iter().all(|j| j.source == REGENERATE_SOURCE));
    }

    #[tokio::test]
    async fn clear_for_entities_ignores_invalid_input() {
        let (queue, _) = queue();
        queue.enqueue_many(&[1, 2], "auto").await.unwrap();
        assert_eq!(queue.clear_for_entities(&[]).await.unwrap(), 0);
        assert_eq!(queue.clear_for_entities(&[0, -1]).await.unwrap(), 0);
        assert_eq!(queue.clear_for_entities(&[2, 9]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn claim_batch_with_fewer_jobs_than_limit() {
        let (queue, _) = queue();
        queue.enqueue_many(&[10, 11, 12], "auto").await.unwrap();

        let claimed = queue.claim_batch(5).await.unwrap();
        assert_eq!(claimed.len(), 3);
        for job in &claimed {
            assert_eq!(job.status, JobStatus::Processing);
            assert_eq!(job.attempts, 1);
            assert!(job.locked_at.is_some());
        }
        let ids: Vec<_> = claimed.iter().map(|j| j.entity_id.get()).collect();
        assert_eq!(ids, vec![10, 11, 12]);
        assert!(queue.claim_batch(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claim_batch_zero_limit_claims_one() {
        let (queue, _) = queue();
        queue.enqueue_many(&[1, 2], "auto").await.unwrap();
        assert_eq!(queue.claim_batch(0).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_never_overlap() {
        let (queue, _) = queue();
        let queue = Arc::new(queue);
        let ids: Vec<i64> = (1..=60).collect();
        queue.enqueue_many(&ids, "bulk").await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                loop {
                    let batch = queue.claim_batch(5).await.unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    mine.extend(batch.into_iter().map(|j| j.id));
                    tokio::task::yield_now().await;
                }
                mine
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "job {id} claimed twice");
            }
        }
        assert_eq!(seen.len(), 60);
    }

    #[tokio::test]
    async fn transitions_follow_the_job_lifecycle() {
        let (queue, _) = queue();
        queue.enqueue(5, "auto").await.unwrap();
        let job = queue.claim_batch(1).await.unwrap().remove(0);

        queue.mark_retry(job.id, "<p>timeout</p>").await.unwrap();
        let retried = queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(retried.status, JobStatus::Pending);
        assert_eq!(retried.attempts, 1);
        assert!(retried.locked_at.is_none());
        assert_eq!(retried.last_error.as_deref(), Some("timeout"));

        queue.mark_complete(job.id).await.unwrap();
        let done = queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.last_error, None);
        assert!(done.completed_at.is_some());

        queue.mark_failed(job.id, "gave up").await.unwrap();
        queue.retry_job(job.id).await.unwrap();
        let reset = queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(reset.status, JobStatus::Pending);
        assert_eq!(reset.last_error, None);

        assert!(!queue.mark_complete(JobId::new(404)).await.unwrap());
    }

    #[tokio::test]
    async fn long_errors_are_word_trimmed() {
        let (queue, _) = queue();
        queue.enqueue(1, "auto").await.unwrap();
        let job = queue.claim_batch(1).await.unwrap().remove(0);
        let message = vec!["word"; 500].join(" ");

        queue.mark_failed(job.id, &message).await.unwrap();
        let failed = queue.get_failures().await.unwrap().remove(0);
        let stored = failed.last_error.unwrap();
        assert_eq!(stored.split_whitespace().count(), 120);
        assert!(stored.ends_with('…'));
    }

    #[tokio::test]
    async fn retry_failed_requeues_everything() {
        let (queue, _) = queue();
        queue.enqueue_many(&[1, 2, 3], "auto").await.unwrap();
        for job in queue.claim_batch(3).await.unwrap() {
            queue.mark_failed(job.id, "nope").await.unwrap();
        }
        assert_eq!(queue.get_recent_failures(2).await.unwrap().len(), 2);
        assert_eq!(queue.retry_failed().await.unwrap(), 3);
        assert_eq!(queue.get_stats().await.unwrap().pending, 3);
    }

    #[tokio::test]
    async fn reset_stale_is_idempotent_and_clamped() {
        let (queue, _) = queue();
        queue.enqueue_many(&[1, 2], "auto").await.unwrap();
        let claimed = queue.claim_batch(2).await.unwrap();

        let mut stale = claimed[0].clone();
        stale.locked_at = Some(Utc::now() - chrono::Duration::seconds(700));
        queue.store().put(stale.clone()).unwrap();
        let mut recent = claimed[1].clone();
        recent.locked_at = Some(Utc::now() - chrono::Duration::seconds(30));
        queue.store().put(recent.clone()).unwrap();

        // A zero timeout is raised to the minimum, so the 30s lock survives.
        assert_eq!(queue.reset_stale(Duration::ZERO).await.unwrap(), 1);
        assert_eq!(queue.reset_stale(DEFAULT_STALE_TIMEOUT).await.unwrap(), 0);

        assert_eq!(queue.get(stale.id).await.unwrap().unwrap().status, JobStatus::Pending);
        assert_eq!(queue.get(recent.id).await.unwrap().unwrap().status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn completed_cleanup_respects_age() {
        let (queue, _) = queue();
        queue.enqueue_many(&[1, 2, 3], "auto").await.unwrap();
        let claimed = queue.claim_batch(3).await.unwrap();
        for job in &claimed {
            queue.mark_complete(job.id).await.unwrap();
        }
        let mut old = queue.get(claimed[0].id).await.unwrap().unwrap();
        old.completed_at = Some(Utc::now() - chrono::Duration::days(3));
        queue.store().put(old).unwrap();
        let mut recent = queue.get(claimed[1].id).await.unwrap().unwrap();
        recent.completed_at = Some(Utc::now() - chrono::Duration::seconds(120));
        queue.store().put(recent).unwrap();

        let stats = queue.get_stats().await.unwrap();
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.completed_recent, 2);
        assert!(!stats.has_jobs);

        // Clamped to 300s, so the 120s-old completion is kept.
        assert_eq!(queue.purge_completed(Duration::from_secs(1)).await.unwrap(), 1);
        assert_eq!(queue.clear_completed(Duration::ZERO).await.unwrap(), 2);
        assert_eq!(queue.get_stats().await.unwrap().completed, 0);
    }

    #[tokio::test]
    async fn stats_on_empty_queue() {
        let (queue, _) = queue();
        assert_eq!(queue.get_stats().await.unwrap(), QueueStats::default());
        assert!(queue.get_recent(DEFAULT_RECENT_LIMIT).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn schedule_processing_clamps_delay_and_is_idempotent() {
        let (queue, scheduler) = queue();
        assert!(queue.schedule_processing(Duration::from_secs(1)));
        assert!(!queue.schedule_processing(Duration::from_secs(60)));
        let requests = scheduler.requests.lock().unwrap().clone();
        assert_eq!(requests, vec![MIN_SCHEDULE_DELAY, Duration::from_secs(60)]);
    }

    proptest! {
        #[test]
        fn repeated_enqueue_leaves_one_active_row(entity in 1i64..10_000, repeats in 1usize..5) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let (queue, _) = queue();
                for _ in 0..repeats {
                    queue.enqueue(entity, "auto").await.unwrap();
                }
                assert_eq!(active_rows(&queue, entity).await, 1);
            });
        }
    }
}
