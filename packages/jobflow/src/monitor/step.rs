use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::definition::{ErrorTolerance, FailureAction};
use crate::dispatcher::panic_message;
use crate::error::Result;
use crate::events::JobEventKind;
use crate::job::{ChildStats, Job, JobId, JobStatus, StepStatUpdate};
use crate::log::LogLevel;
use crate::status::JobStatusManager;

#[derive(Debug, Clone, Copy)]
pub struct StepMonitorConfig {
    pub poll_interval: Duration,
    /// A step still at zero children after this long is completed
    pub zero_children_grace: Duration,
    /// Overall bound on waiting for children
    pub timeout: Duration,
}

impl From<&EngineConfig> for StepMonitorConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            poll_interval: config.step_poll_interval,
            zero_children_grace: config.zero_children_grace,
            timeout: config.step_timeout,
        }
    }
}

/// The step being watched.
#[derive(Debug, Clone)]
pub struct StepWatch {
    pub manager_id: JobId,
    pub step_id: JobId,
    pub step_name: String,
    pub tolerance: Option<ErrorTolerance>,
}

/// Watches one step's children and makes the terminal decision for it.
///
/// Every decision is written to both the step job and the manager's
/// `step_stats` entry.
#[derive(Clone)]
pub struct StepMonitor {
    status: JobStatusManager,
    config: StepMonitorConfig,
}

impl StepMonitor {
    pub fn new(status: JobStatusManager, config: StepMonitorConfig) -> Self {
        Self { status, config }
    }

    /// Runs [`watch`](Self::watch) on its own task.
    ///
    /// The task resolves to the step's final status. An error or panic inside
    /// the loop fails the step rather than leaving it running.
    pub fn spawn(self, watch: StepWatch, cancel: CancellationToken) -> JoinHandle<JobStatus> {
        tokio::spawn(async move {
            let result = AssertUnwindSafe(self.watch(&watch, &cancel))
                .catch_unwind()
                .await;

            let failure = match result {
                Ok(Ok(status)) => return status,
                Ok(Err(e)) => format!("step monitor error: {e}"),
                Err(panic_info) => format!("step monitor panicked: {}", panic_message(&panic_info)),
            };
            error!(step_id = %watch.step_id, error = %failure, "step monitor aborted");
            self.finalize(&watch, JobStatus::Failed, Some(failure), None)
                .await
        })
    }

    /// Polls until the step reaches a terminal decision and returns it.
    pub async fn watch(&self, watch: &StepWatch, cancel: &CancellationToken) -> Result<JobStatus> {
        let started = Instant::now();
        let mut zero_since: Option<Instant> = None;
        let mut last_reported: Option<ChildStats> = None;

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(step_id = %watch.step_id, step = %watch.step_name, "step monitor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => {}
            }

            let step = self.status.get_job(watch.step_id).await?;
            if step.is_terminal() {
                // Decided elsewhere (e.g. the tree was cancelled); mirror it.
                // Children enqueued after that decision must not run.
                if step.status != JobStatus::Completed {
                    self.status.cancel_outstanding_children(watch.step_id).await?;
                }
                let stats = self.status.child_stats(watch.step_id).await?;
                return Ok(self.finalize(watch, step.status, None, Some(stats)).await);
            }

            if cancel.is_cancelled() {
                self.status.cancel_outstanding_children(watch.step_id).await?;
                let stats = self.status.child_stats(watch.step_id).await?;
                return Ok(self
                    .finalize(watch, JobStatus::Cancelled, None, Some(stats))
                    .await);
            }

            if let Err(e) = self.status.heartbeat(watch.step_id).await {
                warn!(step_id = %watch.step_id, error = %e, "step heartbeat failed");
            }

            let stats = self.status.child_stats(watch.step_id).await?;
            if last_reported != Some(stats) {
                self.report_progress(watch, &step, stats).await;
                last_reported = Some(stats);
            }

            if let Some((status, error)) = self.decide(watch, stats, &mut zero_since) {
                if status == JobStatus::Failed && stats.outstanding() > 0 {
                    self.status.cancel_outstanding_children(watch.step_id).await?;
                }
                let stats = self.status.child_stats(watch.step_id).await?;
                return Ok(self.finalize(watch, status, error, Some(stats)).await);
            }

            if started.elapsed() >= self.config.timeout {
                self.status.cancel_outstanding_children(watch.step_id).await?;
                let stats = self.status.child_stats(watch.step_id).await?;
                let error = format!(
                    "timed out after {}s waiting for child jobs ({} still outstanding)",
                    self.config.timeout.as_secs(),
                    stats.outstanding()
                );
                return Ok(self
                    .finalize(watch, JobStatus::Failed, Some(error), Some(stats))
                    .await);
            }
        }
    }

    /// Terminal decision for the current child counts, if one is due.
    fn decide(
        &self,
        watch: &StepWatch,
        stats: ChildStats,
        zero_since: &mut Option<Instant>,
    ) -> Option<(JobStatus, Option<String>)> {
        if stats.total == 0 {
            let since = *zero_since.get_or_insert_with(Instant::now);
            if since.elapsed() >= self.config.zero_children_grace {
                return Some((JobStatus::Completed, None));
            }
            return None;
        }
        *zero_since = None;

        if let Some(tolerance) = watch.tolerance {
            if tolerance.failure_action == FailureAction::StopAll
                && tolerance.is_reached(stats.failed)
            {
                return Some((
                    JobStatus::Failed,
                    Some(format!(
                        "error tolerance reached: {} child jobs failed (max {})",
                        stats.failed, tolerance.max_child_failures
                    )),
                ));
            }
        }

        if stats.outstanding() > 0 {
            return None;
        }
        if stats.failed == 0 {
            return Some((JobStatus::Completed, None));
        }

        let summary = format!("{} of {} child jobs failed", stats.failed, stats.total);
        match watch.tolerance.map(|t| t.failure_action) {
            None => Some((JobStatus::Failed, Some(summary))),
            // A completed step carries its note as a warning, not as an error.
            Some(FailureAction::MarkWarning) => Some((JobStatus::Completed, Some(summary))),
            Some(_) => Some((JobStatus::Completed, None)),
        }
    }

    async fn report_progress(&self, watch: &StepWatch, step: &Job, stats: ChildStats) {
        self.status
            .publish_progress(JobEventKind::StepProgress, step, stats);

        let update = StepStatUpdate::default()
            .with_children(stats)
            .with_documents(step.document_count);
        if let Err(e) = self
            .status
            .update_step_stat(watch.step_id, watch.manager_id, update)
            .await
        {
            warn!(step_id = %watch.step_id, error = %e, "failed to record step progress");
        }
    }

    /// Writes the decision to the step job and to the manager's `step_stats`.
    ///
    /// Returns the status the step actually ended with, which differs from
    /// `status` when something else finalized it first.
    async fn finalize(
        &self,
        watch: &StepWatch,
        status: JobStatus,
        error: Option<String>,
        stats: Option<ChildStats>,
    ) -> JobStatus {
        let job_error = error.clone().filter(|_| status != JobStatus::Completed);
        if let Err(e) = self
            .status
            .update_job_status(watch.step_id, status, job_error)
            .await
        {
            error!(step_id = %watch.step_id, error = %e, "failed to finalize step job");
        }

        let step = match self.status.find_job(watch.step_id).await {
            Ok(step) => step,
            Err(e) => {
                warn!(step_id = %watch.step_id, error = %e, "failed to reload step job");
                None
            }
        };
        let final_status = step
            .as_ref()
            .filter(|s| s.is_terminal())
            .map_or(status, |s| s.status);

        if let Err(e) = self
            .status
            .update_step_stat_in_manager(watch.step_id, watch.manager_id, final_status)
            .await
        {
            error!(
                step_id = %watch.step_id,
                manager_id = %watch.manager_id,
                error = %e,
                "failed to record step status in manager"
            );
        }

        if let Some(step) = &step {
            let mut update = StepStatUpdate::default().with_documents(step.document_count);
            if let Some(stats) = stats {
                update = update.with_children(stats);
                self.status
                    .publish_progress(JobEventKind::StepProgress, step, stats);
            }
            if let Err(e) = self
                .status
                .update_step_stat(watch.step_id, watch.manager_id, update)
                .await
            {
                warn!(step_id = %watch.step_id, error = %e, "failed to record final step counts");
            }
        }

        let warning = final_status == JobStatus::Completed && error.is_some();
        let message = match (final_status, &error, stats) {
            (JobStatus::Completed, Some(note), _) => {
                format!("Step completed with warning: {note}")
            }
            (JobStatus::Completed, _, Some(s)) if s.total == 0 => {
                "Step completed: no child jobs were spawned".to_string()
            }
            (JobStatus::Completed, _, Some(s)) if s.failed > 0 => format!(
                "Step completed: {} child jobs, {} failed within tolerance",
                s.total, s.failed
            ),
            (_, Some(error), _) => format!("Step {final_status}: {error}"),
            _ => format!("Step {final_status}"),
        };
        let level = match final_status {
            JobStatus::Failed => LogLevel::Error,
            JobStatus::Cancelled => LogLevel::Warn,
            _ if warning => LogLevel::Warn,
            _ => LogLevel::Info,
        };
        if let Err(e) = self.status.add_job_log(watch.step_id, level, message).await {
            warn!(step_id = %watch.step_id, error = %e, "failed to log step outcome");
        }

        info!(
            step_id = %watch.step_id,
            step = %watch.step_name,
            status = %final_status,
            "step finalized"
        );
        final_status
    }
}

impl std::fmt::Debug for StepMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepMonitor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
