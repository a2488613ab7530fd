//! Structured error types for the job engine.
//!
//! `JobflowError` is what the engine's public API returns. Pluggable code
//! (workers, step managers, event handlers) returns `anyhow::Result` and those
//! errors never leave the engine as values: they are recorded on the job they
//! belong to and surface through job status, logs and events.
//!
//! # Example
//!
//! ```ignore
//! match engine.trigger(definition).await {
//!     Ok(job_id) => println!("started {job_id}"),
//!     Err(JobflowError::Definition(e)) => eprintln!("rejected: {e}"),
//!     Err(e) => eprintln!("engine error: {e}"),
//! }
//! ```

use thiserror::Error;

use crate::job::{JobId, JobStatus};

/// Result alias used throughout the crate.
pub type Result<T, E = JobflowError> = std::result::Result<T, E>;

/// Errors returned by a [`JobStore`](crate::store::JobStore) implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job already exists: {0}")]
    Duplicate(JobId),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Job definition validation failures.
///
/// These are raised synchronously by trigger, before any job is created.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("job definition has no steps")]
    Empty,

    #[error("step at position {0} has an empty name")]
    UnnamedStep(usize),

    #[error("duplicate step name: {0}")]
    DuplicateStep(String),

    #[error("step {step} depends on undefined step {dependency}")]
    UnknownDependency { step: String, dependency: String },

    #[error("dependency cycle among steps: {}", .0.join(", "))]
    Cycle(Vec<String>),

    #[error("no step manager registered for type {step_type} (step {step})")]
    UnknownStepType { step: String, step_type: String },

    #[error("invalid config for step {step}: {reason}")]
    InvalidConfig { step: String, reason: String },
}

/// Top-level engine error.
#[derive(Debug, Error)]
pub enum JobflowError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error("worker already registered for job type: {0}")]
    WorkerAlreadyRegistered(String),

    #[error("step manager already registered for step type: {0}")]
    StepManagerAlreadyRegistered(String),

    #[error("no worker registered for job type: {0}")]
    UnknownWorkerType(String),

    #[error("invalid payload for job type {job_type}: {reason}")]
    InvalidPayload { job_type: String, reason: String },

    #[error("invalid status transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    /// A child was offered to a parent that has already finished.
    #[error("parent job {parent} is already {status}")]
    ParentTerminal { parent: JobId, status: JobStatus },

    #[error("job {0} is not a pipeline job")]
    NotAPipeline(JobId),

    #[error("pipeline {0} has no readable definition snapshot")]
    MissingSnapshot(JobId),

    #[error("queue error: {0}")]
    Queue(String),
}

impl JobflowError {
    /// True when the error means the referenced job does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, JobflowError::Store(StoreError::NotFound(_)))
    }
}
