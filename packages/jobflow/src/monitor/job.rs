use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::EngineConfig;
use crate::dispatcher::panic_message;
use crate::error::{JobflowError, Result};
use crate::events::JobEventKind;
use crate::job::{ChildStats, JobId, JobStatus, MetadataPatch};
use crate::status::JobStatusManager;

/// Parent-level watcher.
///
/// Two modes:
///
/// - **progress**: while a pipeline runs, aggregate child counts across its
///   steps, heartbeat the pipeline job and publish `job_progress` events. An
///   event goes out only when the counts changed and at least
///   `progress_interval` passed since the previous one.
/// - **finalize**: a worker job that spawned children stays `running` after
///   its worker returns; the monitor completes it (or fails it, if any child
///   failed) once every child is terminal.
#[derive(Debug, Clone)]
pub struct JobMonitor {
    status: JobStatusManager,
    poll_interval: Duration,
    progress_interval: Duration,
    timeout: Duration,
}

impl JobMonitor {
    pub fn new(status: JobStatusManager, config: &EngineConfig) -> Self {
        Self {
            status,
            poll_interval: config.step_poll_interval,
            progress_interval: config.progress_interval,
            timeout: config.step_timeout,
        }
    }

    /// Counts over every job below a pipeline's steps, including children
    /// spawned by workers.
    pub async fn pipeline_stats(&self, manager_id: JobId) -> Result<ChildStats> {
        let mut total = ChildStats::default();
        let mut stack: Vec<JobId> = self
            .status
            .children(manager_id)
            .await?
            .into_iter()
            .map(|step| step.id)
            .collect();

        while let Some(parent_id) = stack.pop() {
            let children = self.status.children(parent_id).await?;
            total.merge(&ChildStats::from_jobs(&children));
            stack.extend(children.iter().map(|child| child.id));
        }
        Ok(total)
    }

    // =========================================================================
    // Progress
    // =========================================================================

    /// Tracks a pipeline until it is terminal or `stop` fires, then records a
    /// final snapshot.
    pub fn spawn_progress(self, manager_id: JobId, stop: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.track_progress(manager_id, &stop).await {
                warn!(manager_id = %manager_id, error = %e, "progress tracking stopped");
            }
            self.publish_snapshot(manager_id).await;
        })
    }

    async fn track_progress(&self, manager_id: JobId, stop: &CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last: Option<ChildStats> = None;
        let mut last_sent: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            let manager = self.status.get_job(manager_id).await?;
            if manager.is_terminal() {
                return Ok(());
            }
            if let Err(e) = self.status.heartbeat(manager_id).await {
                warn!(manager_id = %manager_id, error = %e, "pipeline heartbeat failed");
            }

            let stats = self.pipeline_stats(manager_id).await?;
            let changed = last != Some(stats);
            let due = last_sent.map_or(true, |at| at.elapsed() >= self.progress_interval);
            if changed && due {
                self.status
                    .publish_progress(JobEventKind::JobProgress, &manager, stats);
                self.record_progress(manager_id, stats).await;
                last = Some(stats);
                last_sent = Some(Instant::now());
            }
        }
    }

    async fn publish_snapshot(&self, manager_id: JobId) {
        let snapshot = async {
            let manager = self.status.get_job(manager_id).await?;
            let stats = self.pipeline_stats(manager_id).await?;
            Ok::<_, JobflowError>((manager, stats))
        };
        match snapshot.await {
            Ok((manager, stats)) => {
                self.status
                    .publish_progress(JobEventKind::JobProgress, &manager, stats);
                self.record_progress(manager_id, stats).await;
            }
            Err(e) => warn!(manager_id = %manager_id, error = %e, "final progress snapshot failed"),
        }
    }

    async fn record_progress(&self, manager_id: JobId, stats: ChildStats) {
        if let Err(e) = self
            .status
            .update_job_metadata(manager_id, MetadataPatch::new().progress(stats))
            .await
        {
            warn!(manager_id = %manager_id, error = %e, "failed to record progress");
        }
    }

    // =========================================================================
    // Finalize
    // =========================================================================

    /// Completes `job_id` once all of its children are terminal.
    pub fn spawn_finalizer(self, job_id: JobId, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let result = AssertUnwindSafe(self.finalize_when_settled(job_id, &shutdown))
                .catch_unwind()
                .await;

            let failure = match result {
                Ok(Ok(status)) => {
                    debug!(job_id = %job_id, status = %status, "job monitor finished");
                    return;
                }
                Ok(Err(e)) => format!("job monitor error: {e}"),
                Err(panic_info) => format!("job monitor panicked: {}", panic_message(&panic_info)),
            };
            error!(job_id = %job_id, error = %failure, "job monitor aborted");
            if let Err(e) = self
                .status
                .update_job_status(job_id, JobStatus::Failed, Some(failure))
                .await
            {
                error!(job_id = %job_id, error = %e, "failed to fail parent job");
            }
        })
    }

    async fn finalize_when_settled(
        &self,
        job_id: JobId,
        shutdown: &CancellationToken,
    ) -> Result<JobStatus> {
        let started = Instant::now();
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    // Left running; the stale detector reclaims it if it is
                    // never picked up again.
                    return Ok(JobStatus::Running);
                }
                _ = ticker.tick() => {}
            }

            let job = self.status.get_job(job_id).await?;
            if job.is_terminal() {
                return Ok(job.status);
            }
            if let Err(e) = self.status.heartbeat(job_id).await {
                warn!(job_id = %job_id, error = %e, "parent heartbeat failed");
            }

            let stats = self.status.child_stats(job_id).await?;
            if stats.is_settled() {
                let (status, error) = if stats.failed > 0 {
                    (
                        JobStatus::Failed,
                        Some(format!("{} of {} child jobs failed", stats.failed, stats.total)),
                    )
                } else {
                    (JobStatus::Completed, None)
                };
                self.status.update_job_status(job_id, status, error).await?;
                return Ok(status);
            }

            if started.elapsed() >= self.timeout {
                self.status.cancel_outstanding_children(job_id).await?;
                let error = format!(
                    "timed out after {}s waiting for {} child jobs",
                    self.timeout.as_secs(),
                    stats.outstanding()
                );
                self.status
                    .update_job_status(job_id, JobStatus::Failed, Some(error))
                    .await?;
                return Ok(JobStatus::Failed);
            }
        }
    }
}
