//! Job persistence.
//!
//! The engine only needs a small set of per-job atomic operations from its
//! store: insert, a status compare-and-set that refuses to leave a terminal
//! status, metadata merge, counter increments and heartbeat touches. Each of
//! those must be atomic for a single job; nothing is required across jobs.

mod memory;

pub use memory::InMemoryJobStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::job::{Job, JobFilter, JobId, JobStatus, MetadataPatch, StepStat, StepStatUpdate};
use crate::log::{LogEntry, LogLevel};

/// Result of a status compare-and-set.
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    /// The status changed. Carries the updated job.
    Applied(Job),
    /// The job was already terminal; nothing changed.
    AlreadyTerminal(JobStatus),
    /// The job already had the requested status.
    Unchanged,
    /// The move is not a legal forward transition (e.g. running -> pending).
    Rejected(JobStatus),
}

/// Which monotonically increasing counter to bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Documents,
    Results,
}

#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    async fn insert(&self, job: Job) -> Result<(), StoreError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Jobs matching `filter`, oldest first.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;

    /// Direct children of `parent_id`, oldest first.
    async fn children(&self, parent_id: JobId) -> Result<Vec<Job>, StoreError>;

    /// Atomically moves a job to `to`, stamping `started_at` on the first move to
    /// running and `completed_at` on the move to a terminal status.
    async fn transition(
        &self,
        id: JobId,
        to: JobStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError>;

    async fn merge_metadata(&self, id: JobId, patch: MetadataPatch) -> Result<(), StoreError>;

    /// Inserts or replaces the `step_stats` entry keyed by `stat.step_id`.
    async fn upsert_step_stat(&self, manager_id: JobId, stat: StepStat) -> Result<(), StoreError>;

    /// Updates the `step_stats` entry for `step_id` inside the manager's
    /// metadata. Returns `false` when the manager has no such entry.
    async fn update_step_stat(
        &self,
        manager_id: JobId,
        step_id: JobId,
        update: StepStatUpdate,
    ) -> Result<bool, StoreError>;

    /// Adds `delta` and returns the new value.
    async fn increment(&self, id: JobId, counter: Counter, delta: u64)
        -> Result<u64, StoreError>;

    async fn touch_heartbeat(&self, id: JobId, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn append_log(&self, entry: LogEntry) -> Result<(), StoreError>;

    /// Log entries for a job at or above `min_level`, in append order.
    async fn logs(
        &self,
        job_id: JobId,
        min_level: Option<LogLevel>,
    ) -> Result<Vec<LogEntry>, StoreError>;
}
