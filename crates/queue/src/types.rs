//! Job rows and the values exchanged with the persistence adapter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use optti_core::{EntityId, JobId};

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by a worker; `locked_at` is set.
    Processing,
    /// Finished successfully.
    Completed,
    /// Failed terminally; needs an explicit retry to run again.
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub entity_id: EntityId,
    pub status: JobStatus,
    /// Incremented on every successful claim.
    pub attempts: u32,
    /// Why the job was enqueued (`auto`, `bulk`, `bulk-regenerate`, ...).
    pub source: String,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Reflect a successful claim in this in-memory copy.
    pub fn mark_claimed(&mut self, locked_at: DateTime<Utc>) {
        self.status = JobStatus::Processing;
        self.attempts += 1;
        self.locked_at = Some(locked_at);
    }

    /// Apply a transition in memory; mirrors what stores persist.
    pub fn apply(&mut self, transition: &JobTransition) {
        self.status = transition.status;
        self.locked_at = None;
        self.last_error = transition.last_error.clone();
        if let Some(at) = transition.completed_at {
            self.completed_at = Some(at);
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked_at.is_some()
    }
}

/// Values for inserting a new pending job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub entity_id: EntityId,
    pub source: String,
    pub enqueued_at: DateTime<Utc>,
}

/// An unconditional status change keyed by job id.
///
/// Every transition clears `locked_at`. `completed_at` is only written when
/// the transition carries one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTransition {
    pub status: JobStatus,
    pub last_error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobTransition {
    pub fn completed(at: DateTime<Utc>) -> Self {
        Self {
            status: JobStatus::Completed,
            last_error: None,
            completed_at: Some(at),
        }
    }

    pub fn retry(message: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Pending,
            last_error: Some(message.into()),
            completed_at: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            last_error: Some(message.into()),
            completed_at: None,
        }
    }

    /// Back to `pending` with lock and error cleared.
    pub fn reset() -> Self {
        Self {
            status: JobStatus::Pending,
            last_error: None,
            completed_at: None,
        }
    }
}

/// Row counts grouped by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Processing => self.processing += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
        }
    }
}

/// Aggregate queue statistics for operators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub failed: u64,
    pub completed: u64,
    /// Completions within the last 24 hours.
    pub completed_recent: u64,
    /// `pending + processing > 0`.
    pub has_jobs: bool,
}

impl QueueStats {
    pub fn from_counts(counts: StatusCounts, completed_recent: u64) -> Self {
        Self {
            pending: counts.pending,
            processing: counts.processing,
            failed: counts.failed,
            completed: counts.completed,
            completed_recent,
            has_jobs: counts.pending + counts.processing > 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job {
            id: JobId::new(1),
            entity_id: EntityId::new(10).unwrap(),
            status: JobStatus::Pending,
            attempts: 0,
            source: "auto".into(),
            last_error: None,
            enqueued_at: Utc::now(),
            locked_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("running"), None);
    }

    #[test]
    fn claim_then_retry_clears_lock() {
        let mut job = job();
        job.mark_claimed(Utc::now());
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.attempts, 1);
        assert!(job.is_locked());

        job.apply(&JobTransition::retry("timeout"));
        assert_eq!(job.status, JobStatus::Pending);
        assert!(!job.is_locked());
        assert_eq!(job.last_error.as_deref(), Some("timeout"));
        assert_eq!(job.attempts, 1);
    }

    #[test]
    fn complete_fail_reset_ends_pending_without_error() {
        let mut job = job();
        job.mark_claimed(Utc::now());
        job.apply(&JobTransition::completed(Utc::now()));
        assert!(job.completed_at.is_some());
        job.apply(&JobTransition::failed("boom"));
        job.apply(&JobTransition::reset());
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.last_error, None);
    }

    #[test]
    fn stats_report_active_work() {
        let mut counts = StatusCounts::default();
        assert!(!QueueStats::from_counts(counts, 0).has_jobs);
        counts.add(JobStatus::Completed, 4);
        assert!(!QueueStats::from_counts(counts, 4).has_jobs);
        counts.add(JobStatus::Processing, 1);
        let stats = QueueStats::from_counts(counts, 4);
        assert!(stats.has_jobs);
        assert_eq!(stats.completed, 4);
    }
}
