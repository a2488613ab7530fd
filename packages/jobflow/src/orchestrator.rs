//! Turns a job definition into a running job tree.
//!
//! ```text
//! trigger(definition)
//!     ├─► prepare: resolve placeholders, validate DAG + step types  (sync errors)
//!     ├─► create manager job (payload = definition snapshot)
//!     └─► spawn drive()
//!             ├─► JobMonitor progress task
//!             └─► for step in execution order:
//!                     ├─► create step job, record step_stats entry
//!                     ├─► StepManager.create_parent_job  (enqueue children)
//!                     ├─► no children expected? complete now
//!                     │   else StepMonitor decides; poll the step job until terminal
//!                     └─► failed? on_error stop → abort | continue → next step
//! ```
//!
//! The manager's final status answers "did the run produce usable output".
//! It is `failed` when a `stop` step failed, or when some step failed and no
//! step ever produced children; otherwise `completed`, even with failed steps.
//! Per-step truth lives in `step_stats` and `had_step_failures`.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::anyhow;
use dashmap::DashMap;
use futures::FutureExt;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::definition::{JobDefinition, OnError, StepDefinition};
use crate::dispatcher::{panic_message, Dispatcher};
use crate::error::{DefinitionError, JobflowError, Result};
use crate::job::{Job, JobId, JobKind, JobMetadata, JobStatus, MetadataPatch, StepStat};
use crate::log::LogLevel;
use crate::monitor::{JobMonitor, StepMonitor, StepMonitorConfig, StepWatch};
use crate::status::JobStatusManager;
use crate::step::{StepContext, StepManagerRegistry};

/// Job type of pipeline (manager) jobs.
pub const PIPELINE_JOB_TYPE: &str = "pipeline";

/// How one step ended.
#[derive(Debug)]
struct StepOutcome {
    status: JobStatus,
    child_count: u64,
    error: Option<String>,
}

#[derive(Clone)]
pub struct Orchestrator {
    status: JobStatusManager,
    dispatcher: Dispatcher,
    steps: Arc<StepManagerRegistry>,
    config: EngineConfig,
    /// Cancellation handles of pipelines being driven
    pipelines: Arc<DashMap<JobId, CancellationToken>>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        status: JobStatusManager,
        dispatcher: Dispatcher,
        steps: StepManagerRegistry,
        config: EngineConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            status,
            dispatcher,
            steps: Arc::new(steps),
            config,
            pipelines: Arc::new(DashMap::new()),
            shutdown,
        }
    }

    /// Resolves placeholders and validates the definition against the
    /// registered step managers.
    pub fn prepare(&self, definition: &JobDefinition) -> Result<JobDefinition, DefinitionError> {
        let resolved = definition.resolve_placeholders();
        resolved.validate()?;

        for step in &resolved.steps {
            let manager = self.steps.get(&step.step_type).ok_or_else(|| {
                DefinitionError::UnknownStepType {
                    step: step.name.clone(),
                    step_type: step.step_type.clone(),
                }
            })?;
            manager
                .validate_config(step)
                .map_err(|e| DefinitionError::InvalidConfig {
                    step: step.name.clone(),
                    reason: format!("{e:#}"),
                })?;
        }
        Ok(resolved)
    }

    /// Validates and starts a pipeline in the background. Returns the manager
    /// job id; everything after validation is reported through job state.
    pub async fn trigger(&self, definition: &JobDefinition) -> Result<JobId> {
        let (job, prepared, cancel) = self.create_pipeline(definition, None).await?;
        self.spawn_drive(job.id, prepared, cancel);
        Ok(job.id)
    }

    /// Runs a pipeline to completion on the caller's task and returns the
    /// final manager job.
    pub async fn run(&self, definition: &JobDefinition) -> Result<Job> {
        let (job, prepared, cancel) = self.create_pipeline(definition, None).await?;
        self.drive(job.id, prepared, cancel).await;
        self.status.get_job(job.id).await
    }

    /// Starts a fresh pipeline from a previous run's definition snapshot. The
    /// previous run is not modified.
    pub async fn rerun(&self, job_id: JobId) -> Result<JobId> {
        let previous = self.status.get_job(job_id).await?;
        if previous.kind != JobKind::Manager {
            return Err(JobflowError::NotAPipeline(job_id));
        }
        let definition: JobDefinition = previous
            .payload
            .get("definition")
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
            .ok_or(JobflowError::MissingSnapshot(job_id))?;

        let (job, prepared, cancel) = self.create_pipeline(&definition, Some(job_id)).await?;
        info!(job_id = %job.id, rerun_of = %job_id, "pipeline rerun");
        self.spawn_drive(job.id, prepared, cancel);
        Ok(job.id)
    }

    /// Signals a running pipeline to stop before its next step. Returns
    /// `false` if it is not being driven by this orchestrator.
    pub fn cancel(&self, job_id: JobId) -> bool {
        match self.pipelines.get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_pipelines(&self) -> usize {
        self.pipelines.len()
    }

    async fn create_pipeline(
        &self,
        definition: &JobDefinition,
        rerun_of: Option<JobId>,
    ) -> Result<(Job, JobDefinition, CancellationToken)> {
        let prepared = self.prepare(definition)?;

        // Snapshot the definition as given, placeholders unresolved.
        let snapshot = serde_json::to_value(definition).map_err(|e| JobflowError::InvalidPayload {
            job_type: PIPELINE_JOB_TYPE.to_string(),
            reason: e.to_string(),
        })?;
        let job = Job::builder()
            .job_type(PIPELINE_JOB_TYPE)
            .kind(JobKind::Manager)
            .payload(json!({ "name": definition.name, "definition": snapshot }))
            .metadata(JobMetadata {
                rerun_of,
                ..Default::default()
            })
            .build();

        let job = self.status.create_job(job).await?;
        let cancel = self.shutdown.child_token();
        self.pipelines.insert(job.id, cancel.clone());

        info!(
            job_id = %job.id,
            name = %definition.name,
            steps = definition.steps.len(),
            "pipeline created"
        );
        self.log(
            job.id,
            LogLevel::Info,
            format!(
                "Pipeline {} created with {} steps",
                definition.name,
                definition.steps.len()
            ),
        )
        .await;
        Ok((job, prepared, cancel))
    }

    fn spawn_drive(&self, manager_id: JobId, definition: JobDefinition, cancel: CancellationToken) {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator.drive(manager_id, definition, cancel).await;
        });
    }

    /// Runs the pipeline and always finalizes the manager job; errors and
    /// panics in the loop fail the pipeline.
    async fn drive(&self, manager_id: JobId, definition: JobDefinition, cancel: CancellationToken) {
        let progress_stop = CancellationToken::new();
        let progress = JobMonitor::new(self.status.clone(), &self.config)
            .spawn_progress(manager_id, progress_stop.clone());

        let result = AssertUnwindSafe(self.run_pipeline(manager_id, &definition, &cancel))
            .catch_unwind()
            .await;

        let (status, error) = match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                error!(job_id = %manager_id, error = %e, "pipeline aborted");
                (JobStatus::Failed, Some(format!("pipeline error: {e}")))
            }
            Err(panic_info) => {
                let panic_msg = panic_message(&panic_info);
                error!(job_id = %manager_id, panic = %panic_msg, "pipeline panicked");
                (JobStatus::Failed, Some(format!("pipeline panicked: {panic_msg}")))
            }
        };
        self.finish(manager_id, status, error).await;

        progress_stop.cancel();
        let _ = progress.await;
        self.pipelines.remove(&manager_id);
    }

    async fn run_pipeline(
        &self,
        manager_id: JobId,
        definition: &JobDefinition,
        cancel: &CancellationToken,
    ) -> Result<(JobStatus, Option<String>)> {
        self.status
            .update_job_status(manager_id, JobStatus::Running, None)
            .await?;

        let order = definition.execution_order()?;
        let mut produced_children = false;
        let mut last_error: Option<String> = None;

        for (index, step) in order.into_iter().enumerate() {
            if cancel.is_cancelled() || self.status.get_job(manager_id).await?.is_terminal() {
                info!(job_id = %manager_id, step = %step.name, "pipeline cancelled before step");
                return Ok((JobStatus::Cancelled, None));
            }

            let outcome = self
                .execute_step(manager_id, index, step, definition, cancel)
                .await?;
            produced_children |= outcome.child_count > 0;

            match outcome.status {
                JobStatus::Completed => {}
                JobStatus::Cancelled => return Ok((JobStatus::Cancelled, None)),
                _ => {
                    let error = format!(
                        "step {} failed: {}",
                        step.name,
                        outcome.error.as_deref().unwrap_or("unknown error")
                    );
                    match step.on_error {
                        OnError::Stop => {
                            self.log(
                                manager_id,
                                LogLevel::Error,
                                format!("{error}; stopping pipeline"),
                            )
                            .await;
                            return Ok((JobStatus::Failed, Some(error)));
                        }
                        OnError::Continue => {
                            self.log(
                                manager_id,
                                LogLevel::Warn,
                                format!("{error}; continuing"),
                            )
                            .await;
                            last_error = Some(error);
                        }
                    }
                }
            }
        }

        match last_error {
            Some(error) if !produced_children => Ok((JobStatus::Failed, Some(error))),
            _ => Ok((JobStatus::Completed, None)),
        }
    }

    async fn execute_step(
        &self,
        manager_id: JobId,
        index: usize,
        step: &StepDefinition,
        definition: &JobDefinition,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome> {
        let manager = self.steps.get(&step.step_type).ok_or_else(|| {
            DefinitionError::UnknownStepType {
                step: step.name.clone(),
                step_type: step.step_type.clone(),
            }
        })?;

        let step_job = Job::builder()
            .job_type(step.step_type.clone())
            .parent_id(manager_id)
            .kind(JobKind::Step)
            .payload(json!({ "config": step.config, "on_error": step.on_error }))
            .metadata(JobMetadata {
                manager_id: Some(manager_id),
                step_name: Some(step.name.clone()),
                step_type: Some(step.step_type.clone()),
                step_index: Some(index),
                ..Default::default()
            })
            .build();
        let step_id = self.status.create_job(step_job).await?.id;

        self.status
            .record_step_stat(
                manager_id,
                StepStat {
                    step_index: index,
                    step_id,
                    step_name: step.name.clone(),
                    step_type: step.step_type.clone(),
                    child_count: 0,
                    document_count: 0,
                    completed_count: 0,
                    failed_count: 0,
                    status: JobStatus::Running,
                },
            )
            .await?;
        if let Err(e) = self
            .status
            .update_job_metadata(
                manager_id,
                MetadataPatch::new().current_step(step.name.clone(), JobStatus::Running),
            )
            .await
        {
            warn!(job_id = %manager_id, error = %e, "failed to record current step");
        }
        self.status
            .update_job_status(step_id, JobStatus::Running, None)
            .await?;
        self.log(
            manager_id,
            LogLevel::Info,
            format!("Step {} ({}) started", step.name, step.step_type),
        )
        .await;

        let ctx = StepContext::new(
            manager_id,
            step_id,
            step.name.clone(),
            self.dispatcher.clone(),
            cancel.clone(),
        );
        let created = AssertUnwindSafe(manager.create_parent_job(&ctx, step, definition))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic_info| {
                Err(anyhow!("step manager panicked: {}", panic_message(&panic_info)))
            });

        match created {
            Ok(returned) if returned != step_id => {
                warn!(
                    step_id = %step_id,
                    returned = %returned,
                    "step manager returned a different job id, watching the step job"
                );
            }
            Ok(_) => {}
            Err(e) => {
                // Whatever the manager enqueued before giving up must not run.
                self.status.cancel_outstanding_children(step_id).await?;
                let child_count = self.status.child_stats(step_id).await?.total;

                let step_job = self.status.get_job(step_id).await?;
                if cancel.is_cancelled() || step_job.status == JobStatus::Cancelled {
                    debug!(
                        step_id = %step_id,
                        step = %step.name,
                        error = %e,
                        "step init interrupted by cancellation"
                    );
                    self.status
                        .update_job_status(step_id, JobStatus::Cancelled, None)
                        .await?;
                    self.status
                        .update_step_stat_in_manager(step_id, manager_id, JobStatus::Cancelled)
                        .await?;
                    return Ok(StepOutcome {
                        status: JobStatus::Cancelled,
                        child_count,
                        error: None,
                    });
                }

                let error = format!("{e:#}");
                error!(step_id = %step_id, step = %step.name, error = %error, "step init failed");

                self.status
                    .update_job_status(step_id, JobStatus::Failed, Some(error.clone()))
                    .await?;
                self.status
                    .update_step_stat_in_manager(step_id, manager_id, JobStatus::Failed)
                    .await?;
                self.log(
                    manager_id,
                    LogLevel::Error,
                    format!("Step {} init failed: {}", step.name, error),
                )
                .await;

                return Ok(StepOutcome {
                    status: JobStatus::Failed,
                    child_count,
                    error: Some(error),
                });
            }
        }

        let spawned = self.status.child_stats(step_id).await?;
        if !manager.returns_child_jobs() && spawned.total == 0 {
            self.status
                .update_job_status(step_id, JobStatus::Completed, None)
                .await?;
            self.status
                .update_step_stat_in_manager(step_id, manager_id, JobStatus::Completed)
                .await?;
            debug!(step_id = %step_id, step = %step.name, "step completed inline");
            return Ok(StepOutcome {
                status: JobStatus::Completed,
                child_count: 0,
                error: None,
            });
        }

        let watch = StepWatch {
            manager_id,
            step_id,
            step_name: step.name.clone(),
            tolerance: step.error_tolerance,
        };
        let monitor = StepMonitor::new(self.status.clone(), StepMonitorConfig::from(&self.config))
            .spawn(watch, cancel.child_token());

        let status = self.wait_for_step(step_id, monitor).await?;
        let step_job = self.status.get_job(step_id).await?;
        let child_count = self.status.child_stats(step_id).await?.total;
        Ok(StepOutcome {
            status,
            child_count,
            error: step_job.error,
        })
    }

    /// Polls the step job until the monitor's decision is visible, then lets
    /// the monitor finish recording it.
    async fn wait_for_step(&self, step_id: JobId, monitor: JoinHandle<JobStatus>) -> Result<JobStatus> {
        loop {
            let step = self.status.get_job(step_id).await?;
            if step.is_terminal() || monitor.is_finished() {
                break;
            }
            tokio::time::sleep(self.config.step_poll_interval).await;
        }

        if let Err(e) = monitor.await {
            error!(step_id = %step_id, error = %e, "step monitor task failed");
        }

        let step = self.status.get_job(step_id).await?;
        if step.is_terminal() {
            return Ok(step.status);
        }

        // The monitor exited without a decision.
        let error = "step monitor exited before the step finished".to_string();
        self.status
            .update_job_status(step_id, JobStatus::Failed, Some(error))
            .await?;
        Ok(self.status.get_job(step_id).await?.status)
    }

    async fn finish(&self, manager_id: JobId, status: JobStatus, error: Option<String>) {
        if let Err(e) = self
            .status
            .update_job_status(manager_id, status, error.clone())
            .await
        {
            error!(job_id = %manager_id, error = %e, "failed to finalize pipeline");
            return;
        }

        let had_step_failures = match self.status.get_job(manager_id).await {
            Ok(job) => job.metadata.had_step_failures,
            Err(_) => false,
        };
        let (level, message) = match (status, error) {
            (JobStatus::Completed, _) if had_step_failures => (
                LogLevel::Warn,
                "Pipeline completed with failed steps".to_string(),
            ),
            (JobStatus::Completed, _) => (LogLevel::Info, "Pipeline completed".to_string()),
            (JobStatus::Failed, Some(error)) => (LogLevel::Error, format!("Pipeline failed: {error}")),
            (other, _) => (LogLevel::Info, format!("Pipeline {other}")),
        };
        self.log(manager_id, level, message).await;
        info!(job_id = %manager_id, status = %status, had_step_failures, "pipeline finished");
    }

    async fn log(&self, job_id: JobId, level: LogLevel, message: String) {
        if let Err(e) = self.status.add_job_log(job_id, level, message).await {
            warn!(job_id = %job_id, error = %e, "failed to append pipeline log");
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("steps", &self.steps)
            .field("active_pipelines", &self.pipelines.len())
            .finish_non_exhaustive()
    }
}
