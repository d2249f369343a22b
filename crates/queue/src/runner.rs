//! Queue draining routine.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::queue::{DEFAULT_CLAIM_LIMIT, DEFAULT_SCHEDULE_DELAY, DEFAULT_STALE_TIMEOUT, Queue};
use crate::store::{JobStore, StoreError};
use crate::types::Job;

/// How a processor classified one claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Transient failure; the job goes back to `pending`.
    Retry(String),
    /// Permanent failure.
    Failed(String),
}

/// Does the work for one claimed job.
///
/// The queue never decides retryability; the processor does.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: &Job) -> JobOutcome;
}

#[async_trait]
impl<P: JobProcessor + ?Sized> JobProcessor for Arc<P> {
    async fn process(&self, job: &Job) -> JobOutcome {
        (**self).process(job).await
    }
}

/// Queue runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Jobs claimed per cycle
    pub batch_size: usize,
    /// A retryable failure on this attempt or later fails the job
    pub max_attempts: u32,
    /// Locks older than this are released at the start of each cycle
    pub stale_timeout: Duration,
    /// Delay before the next cycle when work remains
    pub reschedule_delay: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_CLAIM_LIMIT,
            max_attempts: 3,
            stale_timeout: DEFAULT_STALE_TIMEOUT,
            reschedule_delay: DEFAULT_SCHEDULE_DELAY,
            name: "queue-runner".to_string(),
        }
    }
}

impl RunnerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_stale_timeout(mut self, timeout: Duration) -> Self {
        self.stale_timeout = timeout;
        self
    }
}

/// Result of one drain cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub released_stale: u64,
    pub claimed: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    /// Whether another cycle was armed.
    pub rescheduled: bool,
}

/// Drains a [`Queue`] with a [`JobProcessor`].
pub struct QueueRunner<S, P> {
    queue: Arc<Queue<S>>,
    processor: P,
    config: RunnerConfig,
}

impl<S: JobStore, P: JobProcessor> QueueRunner<S, P> {
    pub fn new(queue: Arc<Queue<S>>, processor: P, config: RunnerConfig) -> Self {
        Self {
            queue,
            processor,
            config,
        }
    }

    pub fn queue(&self) -> &Arc<Queue<S>> {
        &self.queue
    }

    /// Sweep stale locks, claim one batch, process it, and re-arm the
    /// trigger if pending work remains.
    pub async fn run_once(&self) -> Result<BatchReport, StoreError> {
        let mut report = BatchReport {
            released_stale: self.queue.reset_stale(self.config.stale_timeout).await?,
            ..BatchReport::default()
        };

        let jobs = self.queue.claim_batch(self.config.batch_size).await?;
        report.claimed = jobs.len();

        for job in &jobs {
            debug!(
                runner = %self.config.name,
                job_id = %job.id,
                entity_id = %job.entity_id,
                attempt = job.attempts,
                "processing job"
            );
            match self.processor.process(job).await {
                JobOutcome::Completed => {
                    self.queue.mark_complete(job.id).await?;
                    report.completed += 1;
                }
                JobOutcome::Retry(message) if job.attempts >= self.config.max_attempts => {
                    warn!(
                        runner = %self.config.name,
                        job_id = %job.id,
                        attempts = job.attempts,
                        error = %message,
                        "job exhausted its attempts"
                    );
                    self.queue.mark_failed(job.id, &message).await?;
                    report.failed += 1;
                }
                JobOutcome::Retry(message) => {
                    debug!(
                        runner = %self.config.name,
                        job_id = %job.id,
                        error = %message,
                        "job will be retried"
                    );
                    self.queue.mark_retry(job.id, &message).await?;
                    report.retried += 1;
                }
                JobOutcome::Failed(message) => {
                    warn!(
                        runner = %self.config.name,
                        job_id = %job.id,
                        error = %message,
                        "job failed"
                    );
                    self.queue.mark_failed(job.id, &message).await?;
                    report.failed += 1;
                }
            }
        }

        let stats = self.queue.get_stats().await?;
        if stats.pending > 0 {
            report.rescheduled = self.queue.schedule_processing(self.config.reschedule_delay);
        }

        if report.claimed > 0 || report.released_stale > 0 {
            info!(
                runner = %self.config.name,
                claimed = report.claimed,
                completed = report.completed,
                retried = report.retried,
                failed = report.failed,
                released_stale = report.released_stale,
                pending = stats.pending,
                "queue cycle finished"
            );
        }
        Ok(report)
    }
}
