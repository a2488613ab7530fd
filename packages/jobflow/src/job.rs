//! Job model: status lifecycle, typed metadata and step statistics.
//!
//! A pipeline run is a three-level tree:
//!
//! ```text
//! manager job (one per triggered definition)
//!     ├─► step job "crawl"   (parent = manager)
//!     │       ├─► worker job  (parent = step)
//!     │       └─► worker job
//!     └─► step job "enrich"  (parent = manager)
//!             └─► ...
//! ```
//!
//! The manager's metadata carries one [`StepStat`] per step. Those entries are
//! the authoritative per-step outcome; the manager's own status only says
//! whether the run produced usable output.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use typed_builder::TypedBuilder;

pub use crate::id::JobId;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Completed, failed and cancelled jobs never change status again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether `self -> next` is a legal forward move.
    ///
    /// Pending may go straight to a terminal status (a queued job can be
    /// cancelled, or failed when no worker exists for it).
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match self {
            JobStatus::Pending => next != JobStatus::Pending,
            JobStatus::Running => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown job status: {s}"))
    }
}

/// Position of a job in the pipeline tree.
///
/// Doubles as the "originator" tag on log lines and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Manager,
    Step,
    #[default]
    Worker,
}

// ============================================================================
// Metadata
// ============================================================================

/// Per-step execution record stored on the manager job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepStat {
    pub step_index: usize,
    pub step_id: JobId,
    pub step_name: String,
    pub step_type: String,
    pub child_count: u64,
    pub document_count: u64,
    #[serde(default)]
    pub completed_count: u64,
    #[serde(default)]
    pub failed_count: u64,
    pub status: JobStatus,
}

/// Counts of a parent's direct children by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildStats {
    pub total: u64,
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl ChildStats {
    pub fn from_jobs<'a>(jobs: impl IntoIterator<Item = &'a Job>) -> Self {
        let mut stats = Self::default();
        for job in jobs {
            stats.record(job.status);
        }
        stats
    }

    pub fn record(&mut self, status: JobStatus) {
        self.total += 1;
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
    }

    /// Children not yet terminal.
    pub fn outstanding(&self) -> u64 {
        self.pending + self.running
    }

    /// At least one child exists and all of them are terminal.
    pub fn is_settled(&self) -> bool {
        self.total > 0 && self.outstanding() == 0
    }

    pub fn merge(&mut self, other: &ChildStats) {
        self.total += other.total;
        self.pending += other.pending;
        self.running += other.running;
        self.completed += other.completed;
        self.failed += other.failed;
        self.cancelled += other.cancelled;
    }
}

/// Typed job metadata.
///
/// Linkage fields are written once at creation; `step_stats`, `progress` and
/// the current-step fields are only changed through the status manager's narrow
/// update calls. Anything else a collaborator wants to attach goes in `extra`,
/// which merges key by key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub step_stats: Vec<StepStat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager_id: Option<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_status: Option<JobStatus>,
    /// Set on a manager job once any step records `failed`, so consumers do not
    /// have to scan `step_stats` to notice a "completed with failures" run.
    #[serde(default)]
    pub had_step_failures: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<ChildStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerun_of: Option<JobId>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl JobMetadata {
    /// Merges a patch: set fields overwrite, `extra` merges per key.
    pub fn apply(&mut self, patch: MetadataPatch) {
        let MetadataPatch {
            current_step_name,
            current_step_status,
            had_step_failures,
            progress,
            extra,
        } = patch;

        if let Some(name) = current_step_name {
            self.current_step_name = Some(name);
        }
        if let Some(status) = current_step_status {
            self.current_step_status = Some(status);
        }
        if let Some(flag) = had_step_failures {
            // Sticky: a pipeline that saw a failed step never un-sees it.
            self.had_step_failures |= flag;
        }
        if let Some(progress) = progress {
            self.progress = Some(progress);
        }
        for (key, value) in extra {
            self.extra.insert(key, value);
        }
    }

    pub fn step_stat(&self, step_id: JobId) -> Option<&StepStat> {
        self.step_stats.iter().find(|s| s.step_id == step_id)
    }

    pub fn step_stat_by_name(&self, name: &str) -> Option<&StepStat> {
        self.step_stats.iter().find(|s| s.step_name == name)
    }
}

/// A partial metadata update. Unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataPatch {
    pub current_step_name: Option<String>,
    pub current_step_status: Option<JobStatus>,
    pub had_step_failures: Option<bool>,
    pub progress: Option<ChildStats>,
    pub extra: Map<String, Value>,
}

impl MetadataPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_step(mut self, name: impl Into<String>, status: JobStatus) -> Self {
        self.current_step_name = Some(name.into());
        self.current_step_status = Some(status);
        self
    }

    pub fn step_failures(mut self) -> Self {
        self.had_step_failures = Some(true);
        self
    }

    pub fn progress(mut self, stats: ChildStats) -> Self {
        self.progress = Some(stats);
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Narrow update applied to one `step_stats` entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepStatUpdate {
    pub status: Option<JobStatus>,
    pub children: Option<ChildStats>,
    pub document_count: Option<u64>,
}

impl StepStatUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_children(mut self, children: ChildStats) -> Self {
        self.children = Some(children);
        self
    }

    pub fn with_documents(mut self, count: u64) -> Self {
        self.document_count = Some(count);
        self
    }

    pub fn apply(&self, stat: &mut StepStat) {
        if let Some(status) = self.status {
            stat.status = status;
        }
        if let Some(children) = self.children {
            stat.child_count = children.total;
            stat.completed_count = children.completed;
            stat.failed_count = children.failed;
        }
        if let Some(count) = self.document_count {
            stat.document_count = count;
        }
    }
}

// ============================================================================
// Job Model
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default)]
    pub id: JobId,

    #[builder(default, setter(strip_option))]
    pub parent_id: Option<JobId>,

    /// Routing key: a worker type for worker jobs, a step type for step jobs.
    pub job_type: String,

    #[builder(default)]
    pub kind: JobKind,

    #[builder(default)]
    pub status: JobStatus,

    #[builder(default = Value::Null)]
    pub payload: Value,

    #[builder(default)]
    pub metadata: JobMetadata,

    #[builder(default, setter(strip_option))]
    pub error: Option<String>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub last_heartbeat: Option<DateTime<Utc>>,

    #[builder(default)]
    pub document_count: u64,
    #[builder(default)]
    pub result_count: u64,
}

impl Job {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The pipeline (manager) job this job belongs to. A manager is its own.
    pub fn manager_id(&self) -> Option<JobId> {
        match self.kind {
            JobKind::Manager => Some(self.id),
            _ => self.metadata.manager_id,
        }
    }

    pub fn step_name(&self) -> Option<&str> {
        self.metadata.step_name.as_deref()
    }
}

// ============================================================================
// Filters
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParentFilter {
    #[default]
    Any,
    /// Top-level jobs only.
    Root,
    Of(JobId),
}

impl FromStr for ParentFilter {
    type Err = uuid::Error;

    /// `"root"` selects top-level jobs, anything else must be a job id.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "any" => Ok(ParentFilter::Any),
            "root" => Ok(ParentFilter::Root),
            other => Ok(ParentFilter::Of(JobId::parse(other)?)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub parent: ParentFilter,
    /// Empty means any status.
    pub statuses: Vec<JobStatus>,
    pub job_type: Option<String>,
}

impl JobFilter {
    pub fn roots() -> Self {
        Self {
            parent: ParentFilter::Root,
            ..Default::default()
        }
    }

    pub fn children_of(parent: JobId) -> Self {
        Self {
            parent: ParentFilter::Of(parent),
            ..Default::default()
        }
    }

    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = JobStatus>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    pub fn with_job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        let parent_ok = match self.parent {
            ParentFilter::Any => true,
            ParentFilter::Root => job.parent_id.is_none(),
            ParentFilter::Of(id) => job.parent_id == Some(id),
        };
        parent_ok
            && (self.statuses.is_empty() || self.statuses.contains(&job.status))
            && self.job_type.as_deref().map_or(true, |t| t == job.job_type)
    }
}
