//! The single write path for job state.
//!
//! Orchestrator, dispatcher, workers and monitors never touch the store
//! directly for mutations; they go through [`JobStatusManager`], which turns
//! every successful change into the matching [`JobEvent`].
//!
//! ```text
//! caller ──► JobStatusManager ──► JobStore (atomic per job)
//!                   │
//!                   └──► EventBus (lifecycle / progress / log events)
//! ```
//!
//! Status writes are correctness-critical and their errors propagate. Callers
//! doing best-effort writes (progress, logs) log the error and continue.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::error::{JobflowError, Result, StoreError};
use crate::events::{JobEvent, JobEventKind};
use crate::job::{
    ChildStats, Job, JobFilter, JobId, JobKind, JobStatus, MetadataPatch, StepStat,
    StepStatUpdate,
};
use crate::log::{LogEntry, LogLevel};
use crate::store::{Counter, JobStore, TransitionOutcome};

#[derive(Clone)]
pub struct JobStatusManager {
    store: Arc<dyn JobStore>,
    bus: EventBus,
}

impl JobStatusManager {
    pub fn new(store: Arc<dyn JobStore>, bus: EventBus) -> Self {
        Self { store, bus }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    // =========================================================================
    // Creation and reads
    // =========================================================================

    /// Persists a new job. Its status is forced to `pending` and its lifecycle
    /// timestamps cleared regardless of what the caller built.
    pub async fn create_job(&self, mut job: Job) -> Result<Job> {
        job.status = JobStatus::Pending;
        job.started_at = None;
        job.completed_at = None;
        job.created_at = Utc::now();

        self.store.insert(job.clone()).await?;
        debug!(
            job_id = %job.id,
            job_type = %job.job_type,
            parent_id = ?job.parent_id,
            "job created"
        );
        self.bus
            .publish(JobEvent::for_job(JobEventKind::JobCreated, &job));
        Ok(job)
    }

    pub async fn find_job(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.store.get(id).await?)
    }

    pub async fn get_job(&self, id: JobId) -> Result<Job> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id).into())
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        Ok(self.store.list(filter).await?)
    }

    pub async fn children(&self, parent_id: JobId) -> Result<Vec<Job>> {
        Ok(self.store.children(parent_id).await?)
    }

    pub async fn child_stats(&self, parent_id: JobId) -> Result<ChildStats> {
        let children = self.store.children(parent_id).await?;
        Ok(ChildStats::from_jobs(&children))
    }

    pub async fn logs(&self, job_id: JobId, min_level: Option<LogLevel>) -> Result<Vec<LogEntry>> {
        Ok(self.store.logs(job_id, min_level).await?)
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// Moves a job to `status`.
    ///
    /// Returns `Ok(true)` when the status changed, `Ok(false)` when the job was
    /// already terminal or already had that status, so late or retried calls
    /// are harmless. Backwards moves are an error.
    pub async fn update_job_status(
        &self,
        id: JobId,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<bool> {
        let outcome = self.store.transition(id, status, error, Utc::now()).await?;

        match outcome {
            TransitionOutcome::Applied(job) => {
                debug!(job_id = %id, status = %status, "job status changed");

                let mut event = JobEvent::lifecycle(&job);
                if let Some(error) = &job.error {
                    if status == JobStatus::Failed {
                        event = event.with_message(error.clone());
                    }
                }
                self.bus.publish(event);

                // Worker chatter stays out of observers' feeds.
                let level = match job.kind {
                    JobKind::Worker => LogLevel::Debug,
                    _ => LogLevel::Info,
                };
                let message = match (&job.error, status) {
                    (Some(error), JobStatus::Failed) => format!("Status changed: failed ({error})"),
                    _ => format!("Status changed: {status}"),
                };
                self.log_for(&job, level, message).await;
                Ok(true)
            }
            TransitionOutcome::AlreadyTerminal(current) => {
                debug!(
                    job_id = %id,
                    current = %current,
                    requested = %status,
                    "ignoring status update on terminal job"
                );
                Ok(false)
            }
            TransitionOutcome::Unchanged => Ok(false),
            TransitionOutcome::Rejected(from) => Err(JobflowError::InvalidTransition {
                id,
                from,
                to: status,
            }),
        }
    }

    pub async fn heartbeat(&self, id: JobId) -> Result<()> {
        Ok(self.store.touch_heartbeat(id, Utc::now()).await?)
    }

    // =========================================================================
    // Metadata and counters
    // =========================================================================

    pub async fn update_job_metadata(&self, id: JobId, patch: MetadataPatch) -> Result<()> {
        if patch.is_empty() {
            return Ok(());
        }
        Ok(self.store.merge_metadata(id, patch).await?)
    }

    /// Atomically adds `delta` documents; returns the new count.
    pub async fn increment_document_count(&self, id: JobId, delta: u64) -> Result<u64> {
        Ok(self.store.increment(id, Counter::Documents, delta).await?)
    }

    pub async fn increment_result_count(&self, id: JobId, delta: u64) -> Result<u64> {
        Ok(self.store.increment(id, Counter::Results, delta).await?)
    }

    /// Inserts or replaces a step's execution record on its manager.
    pub async fn record_step_stat(&self, manager_id: JobId, stat: StepStat) -> Result<()> {
        let failed = stat.status == JobStatus::Failed;
        self.store.upsert_step_stat(manager_id, stat).await?;
        if failed {
            self.flag_step_failure(manager_id).await?;
        }
        Ok(())
    }

    /// Sets the status of the `step_stats` entry for `step_id` inside the
    /// manager's metadata. Every terminal step decision must come through here.
    pub async fn update_step_stat_in_manager(
        &self,
        step_id: JobId,
        manager_id: JobId,
        status: JobStatus,
    ) -> Result<bool> {
        self.update_step_stat(step_id, manager_id, StepStatUpdate::status(status))
            .await
    }

    /// Applies a step stat update. Returns `false` (and warns) when the manager
    /// has no entry for the step.
    pub async fn update_step_stat(
        &self,
        step_id: JobId,
        manager_id: JobId,
        update: StepStatUpdate,
    ) -> Result<bool> {
        let found = self
            .store
            .update_step_stat(manager_id, step_id, update)
            .await?;
        if !found {
            warn!(
                step_id = %step_id,
                manager_id = %manager_id,
                "no step_stats entry for step"
            );
            return Ok(false);
        }
        if update.status == Some(JobStatus::Failed) {
            self.flag_step_failure(manager_id).await?;
        }
        Ok(true)
    }

    async fn flag_step_failure(&self, manager_id: JobId) -> Result<()> {
        self.store
            .merge_metadata(manager_id, MetadataPatch::new().step_failures())
            .await?;
        Ok(())
    }

    // =========================================================================
    // Logs
    // =========================================================================

    /// Appends a log line to a job.
    ///
    /// Every level is persisted; only info and above are published as
    /// `job_log` events. The originator and owning manager/step are resolved
    /// from the job itself.
    pub async fn add_job_log(
        &self,
        job_id: JobId,
        level: LogLevel,
        message: impl Into<String>,
    ) -> Result<()> {
        let job = self.get_job(job_id).await?;
        self.append_log(&job, level, message.into()).await
    }

    async fn append_log(&self, job: &Job, level: LogLevel, message: String) -> Result<()> {
        let entry = LogEntry {
            job_id: job.id,
            level,
            message,
            originator: job.kind,
            manager_id: job.manager_id(),
            step_name: job.metadata.step_name.clone(),
            timestamp: Utc::now(),
        };
        self.store.append_log(entry.clone()).await?;

        if level.should_forward() {
            self.bus.publish(
                JobEvent::for_job(JobEventKind::JobLog, job)
                    .with_level(level)
                    .with_message(entry.message),
            );
        }
        Ok(())
    }

    /// Best-effort log on an already loaded job.
    async fn log_for(&self, job: &Job, level: LogLevel, message: String) {
        if let Err(e) = self.append_log(job, level, message).await {
            warn!(job_id = %job.id, error = %e, "failed to append job log");
        }
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    /// Cancels a job and every non-terminal descendant.
    ///
    /// Returns the ids that actually moved to `cancelled`, the root first.
    pub async fn cancel_job_tree(&self, id: JobId) -> Result<Vec<JobId>> {
        // Fail fast on unknown ids.
        self.get_job(id).await?;

        let mut cancelled = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if self
                .update_job_status(next, JobStatus::Cancelled, None)
                .await?
            {
                cancelled.push(next);
            }
            let children = self.store.children(next).await?;
            stack.extend(children.into_iter().rev().map(|child| child.id));
        }

        info!(job_id = %id, cancelled = cancelled.len(), "job tree cancelled");
        Ok(cancelled)
    }

    /// Cancels the direct children of `parent_id` that are still pending or
    /// running. Used when a step is finalized before its children settle.
    pub async fn cancel_outstanding_children(&self, parent_id: JobId) -> Result<Vec<JobId>> {
        let mut cancelled = Vec::new();
        for child in self.store.children(parent_id).await? {
            if child.is_terminal() {
                continue;
            }
            if self
                .update_job_status(child.id, JobStatus::Cancelled, None)
                .await?
            {
                cancelled.push(child.id);
            }
        }
        Ok(cancelled)
    }

    /// Publishes a progress event for a job without touching state.
    pub(crate) fn publish_progress(&self, kind: JobEventKind, job: &Job, stats: ChildStats) {
        self.bus.publish(JobEvent::for_job(kind, job).with_stats(stats));
    }
}

impl std::fmt::Debug for JobStatusManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStatusManager")
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobMetadata;
    use crate::store::InMemoryJobStore;
    use tokio::sync::broadcast::error::TryRecvError;

    fn manager() -> JobStatusManager {
        JobStatusManager::new(Arc::new(InMemoryJobStore::new()), EventBus::new())
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<JobEvent>) -> Vec<JobEvent> {
        let mut events = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                Err(TryRecvError::Lagged(_)) => continue,
            }
        }
        events
    }

    #[tokio::test]
    async fn test_create_forces_pending() {
        let status = manager();
        let job = Job::builder()
            .job_type("echo")
            .status(JobStatus::Completed)
            .build();

        let created = status.create_job(job).await.unwrap();
        assert_eq!(created.status, JobStatus::Pending);
        assert!(created.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_late_update_after_terminal_is_noop() {
        let status = manager();
        let job = status
            .create_job(Job::builder().job_type("echo").build())
            .await
            .unwrap();

        assert!(status
            .update_job_status(job.id, JobStatus::Running, None)
            .await
            .unwrap());
        assert!(status
            .update_job_status(job.id, JobStatus::Completed, None)
            .await
            .unwrap());

        for late in [JobStatus::Failed, JobStatus::Cancelled, JobStatus::Running] {
            let applied = status
                .update_job_status(job.id, late, Some("late".into()))
                .await
                .unwrap();
            assert!(!applied);
        }

        let job = status.get_job(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.error.is_none());
    }

    #[tokio::test]
    async fn test_backwards_update_is_an_error() {
        let status = manager();
        let job = status
            .create_job(Job::builder().job_type("echo").build())
            .await
            .unwrap();
        status
            .update_job_status(job.id, JobStatus::Running, None)
            .await
            .unwrap();

        let err = status
            .update_job_status(job.id, JobStatus::Pending, None)
            .await
            .unwrap_err();
        assert!(matches!(err, JobflowError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_lifecycle_events_published() {
        let status = manager();
        let mut rx = status.bus().stream();

        let job = status
            .create_job(Job::builder().job_type("echo").build())
            .await
            .unwrap();
        status
            .update_job_status(job.id, JobStatus::Running, None)
            .await
            .unwrap();
        status
            .update_job_status(job.id, JobStatus::Failed, Some("boom".into()))
            .await
            .unwrap();

        let kinds: Vec<_> = drain(&mut rx).into_iter().map(|e| e.kind).collect();
        // Worker status logs are debug level and not forwarded.
        assert_eq!(
            kinds,
            vec![
                JobEventKind::JobCreated,
                JobEventKind::JobStarted,
                JobEventKind::JobFailed
            ]
        );
    }

    #[tokio::test]
    async fn test_logs_persist_all_levels_forward_info_and_above() {
        let status = manager();
        let job = status
            .create_job(Job::builder().job_type("echo").build())
            .await
            .unwrap();
        let mut rx = status.bus().stream();

        status.add_job_log(job.id, LogLevel::Debug, "raw html").await.unwrap();
        status.add_job_log(job.id, LogLevel::Info, "fetched").await.unwrap();
        status.add_job_log(job.id, LogLevel::Error, "timeout").await.unwrap();

        assert_eq!(status.logs(job.id, None).await.unwrap().len(), 3);

        let forwarded: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| e.kind == JobEventKind::JobLog)
            .map(|e| (e.level, e.message))
            .collect();
        assert_eq!(
            forwarded,
            vec![
                (Some(LogLevel::Info), Some("fetched".to_string())),
                (Some(LogLevel::Error), Some("timeout".to_string())),
            ]
        );
    }

    #[tokio::test]
    async fn test_log_resolves_originator_and_hierarchy() {
        let status = manager();
        let pipeline = status
            .create_job(Job::builder().job_type("pipeline").kind(JobKind::Manager).build())
            .await
            .unwrap();
        let step = status
            .create_job(
                Job::builder()
                    .job_type("fan_out")
                    .kind(JobKind::Step)
                    .parent_id(pipeline.id)
                    .metadata(JobMetadata {
                        manager_id: Some(pipeline.id),
                        step_name: Some("crawl".into()),
                        ..Default::default()
                    })
                    .build(),
            )
            .await
            .unwrap();

        status.add_job_log(step.id, LogLevel::Info, "starting").await.unwrap();

        let logs = status.logs(step.id, None).await.unwrap();
        assert_eq!(logs[0].originator, JobKind::Step);
        assert_eq!(logs[0].manager_id, Some(pipeline.id));
        assert_eq!(logs[0].step_name.as_deref(), Some("crawl"));
    }

    #[tokio::test]
    async fn test_failed_step_stat_flags_manager() {
        let status = manager();
        let pipeline = status
            .create_job(Job::builder().job_type("pipeline").kind(JobKind::Manager).build())
            .await
            .unwrap();
        let step_id = JobId::new();
        status
            .record_step_stat(
                pipeline.id,
                StepStat {
                    step_index: 0,
                    step_id,
                    step_name: "crawl".into(),
                    step_type: "fan_out".into(),
                    child_count: 0,
                    document_count: 0,
                    completed_count: 0,
                    failed_count: 0,
                    status: JobStatus::Running,
                },
            )
            .await
            .unwrap();
        assert!(!status.get_job(pipeline.id).await.unwrap().metadata.had_step_failures);

        assert!(status
            .update_step_stat_in_manager(step_id, pipeline.id, JobStatus::Failed)
            .await
            .unwrap());

        let pipeline = status.get_job(pipeline.id).await.unwrap();
        assert!(pipeline.metadata.had_step_failures);
        assert_eq!(pipeline.metadata.step_stats[0].status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancel_tree_skips_terminal_descendants() {
        let status = manager();
        let root = status
            .create_job(Job::builder().job_type("pipeline").kind(JobKind::Manager).build())
            .await
            .unwrap();
        let done = status
            .create_job(Job::builder().job_type("echo").parent_id(root.id).build())
            .await
            .unwrap();
        let queued = status
            .create_job(Job::builder().job_type("echo").parent_id(root.id).build())
            .await
            .unwrap();
        let grandchild = status
            .create_job(Job::builder().job_type("echo").parent_id(queued.id).build())
            .await
            .unwrap();

        status
            .update_job_status(done.id, JobStatus::Completed, None)
            .await
            .unwrap();

        let cancelled = status.cancel_job_tree(root.id).await.unwrap();
        assert_eq!(cancelled, vec![root.id, queued.id, grandchild.id]);
        assert_eq!(
            status.get_job(done.id).await.unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_cancel_unknown_job() {
        let status = manager();
        let err = status.cancel_job_tree(JobId::new()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    async fn assert_concurrent_increments(n: u64) {
        let status = manager();
        let parent = status
            .create_job(Job::builder().job_type("pipeline").build())
            .await
            .unwrap();

        let handles: Vec<_> = (0..n)
            .map(|_| {
                let status = status.clone();
                tokio::spawn(async move { status.increment_document_count(parent.id, 1).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(status.get_job(parent.id).await.unwrap().document_count, n);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_document_increments() {
        for n in [1, 10, 1000] {
            assert_concurrent_increments(n).await;
        }
    }
}
