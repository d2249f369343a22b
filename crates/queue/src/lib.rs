//! Durable background job queue with claim-based locking.
//!
//! ## Design
//!
//! - Jobs live in a [`JobStore`]; the [`Queue`] owns every mutation of them.
//! - Workers claim jobs with a single-row conditional update keyed by
//!   `id` and `status = 'pending'`. That update is the only lock: two
//!   concurrent claimers can never both win the same row.
//! - Jobs stuck in `processing` (crashed worker) are released by
//!   [`Queue::reset_stale`], which the [`QueueRunner`] runs at the start of
//!   every cycle.
//! - Draining is triggered through a [`DeferredScheduler`] that arms at most
//!   one pending trigger per queue.
//!
//! ## Components
//!
//! - [`Job`], [`JobStatus`]: persisted job rows
//! - [`JobStore`]: persistence adapter ([`InMemoryJobStore`], [`SqliteJobStore`])
//! - [`Queue`]: enqueue/claim/transition policy
//! - [`DeferredScheduler`]: idempotent one-shot triggers ([`TokioScheduler`])
//! - [`QueueRunner`], [`JobProcessor`]: the draining routine

pub mod namespace;
pub mod queue;
pub mod runner;
pub mod scheduler;
pub mod sqlite;
pub mod store;
pub mod types;

pub use namespace::QueueNamespace;
pub use queue::{EnqueueOutcome, Queue};
pub use runner::{BatchReport, JobOutcome, JobProcessor, QueueRunner, RunnerConfig};
pub use scheduler::{DeferredScheduler, TokioScheduler};
pub use sqlite::SqliteJobStore;
pub use store::{InMemoryJobStore, JobStore, StoreError};
pub use types::{Job, JobStatus, JobTransition, NewJob, QueueStats, StatusCounts};
