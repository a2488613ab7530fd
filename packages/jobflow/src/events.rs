//! Job lifecycle events.
//!
//! Every state change the engine makes is mirrored as a [`JobEvent`] on the
//! [`EventBus`](crate::bus::EventBus). Events are notifications only: observers
//! that miss some must re-read job state, which is the source of truth.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{ChildStats, Job, JobId, JobKind, JobStatus};
use crate::log::LogLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    JobCreated,
    JobStarted,
    JobCompleted,
    JobFailed,
    JobCancelled,
    StepProgress,
    JobProgress,
    JobLog,
}

impl JobEventKind {
    /// The lifecycle event announcing a move to `status`.
    pub fn for_status(status: JobStatus) -> Self {
        match status {
            JobStatus::Pending => JobEventKind::JobCreated,
            JobStatus::Running => JobEventKind::JobStarted,
            JobStatus::Completed => JobEventKind::JobCompleted,
            JobStatus::Failed => JobEventKind::JobFailed,
            JobStatus::Cancelled => JobEventKind::JobCancelled,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobEventKind::JobCreated => "job_created",
            JobEventKind::JobStarted => "job_started",
            JobEventKind::JobCompleted => "job_completed",
            JobEventKind::JobFailed => "job_failed",
            JobEventKind::JobCancelled => "job_cancelled",
            JobEventKind::StepProgress => "step_progress",
            JobEventKind::JobProgress => "job_progress",
            JobEventKind::JobLog => "job_log",
        }
    }
}

/// Payload delivered to event handlers and, serialized, to external observers.
///
/// `parent_id`, `manager_id` and `step_name` are absent for root-level jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    #[serde(rename = "type")]
    pub kind: JobEventKind,
    pub job_id: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager_id: Option<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    pub originator: JobKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<LogLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<ChildStats>,
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    /// Builds an event describing `job` in its current state.
    pub fn for_job(kind: JobEventKind, job: &Job) -> Self {
        Self {
            kind,
            job_id: job.id,
            parent_id: job.parent_id,
            manager_id: job.manager_id(),
            step_name: job.metadata.step_name.clone(),
            originator: job.kind,
            status: Some(job.status),
            level: None,
            message: None,
            stats: None,
            timestamp: Utc::now(),
        }
    }

    /// Lifecycle event for a job that just moved to its current status.
    pub fn lifecycle(job: &Job) -> Self {
        Self::for_job(JobEventKind::for_status(job.status), job)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = Some(level);
        self
    }

    pub fn with_stats(mut self, stats: ChildStats) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            JobEventKind::JobCompleted | JobEventKind::JobFailed | JobEventKind::JobCancelled
        )
    }
}
