//! Step managers: expand one pipeline step into child jobs.
//!
//! The orchestrator creates the step job, then hands it to the manager
//! registered for the step's type. The manager enqueues zero or more worker
//! jobs under it through [`StepContext::spawn_child`].

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context as _};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::definition::{JobDefinition, StepDefinition};
use crate::dispatcher::Dispatcher;
use crate::error::{JobflowError, Result};
use crate::job::{Job, JobId, JobKind, JobMetadata, JobStatus};
use crate::log::LogLevel;
use crate::status::JobStatusManager;

/// Where a step manager is working: the pipeline, the step job and the
/// means to enqueue children.
pub struct StepContext {
    manager_id: JobId,
    step_id: JobId,
    step_name: String,
    dispatcher: Dispatcher,
    cancel: CancellationToken,
}

impl StepContext {
    pub(crate) fn new(
        manager_id: JobId,
        step_id: JobId,
        step_name: impl Into<String>,
        dispatcher: Dispatcher,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            manager_id,
            step_id,
            step_name: step_name.into(),
            dispatcher,
            cancel,
        }
    }

    pub fn manager_id(&self) -> JobId {
        self.manager_id
    }

    pub fn step_id(&self) -> JobId {
        self.step_id
    }

    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    /// Fires when the pipeline is cancelled or the engine shuts down.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn status(&self) -> &JobStatusManager {
        self.dispatcher.status()
    }

    pub async fn log(&self, level: LogLevel, message: impl Into<String>) -> Result<()> {
        self.status().add_job_log(self.step_id, level, message).await
    }

    /// Enqueues a worker job as a child of this step.
    ///
    /// Fails with [`JobflowError::ParentTerminal`] once the pipeline is
    /// cancelled or the step job has already finished.
    pub async fn spawn_child(&self, job_type: impl Into<String>, payload: Value) -> Result<JobId> {
        if self.cancel.is_cancelled() {
            return Err(JobflowError::ParentTerminal {
                parent: self.step_id,
                status: JobStatus::Cancelled,
            });
        }
        let step = self.status().get_job(self.step_id).await?;
        if step.is_terminal() {
            return Err(JobflowError::ParentTerminal {
                parent: self.step_id,
                status: step.status,
            });
        }

        let job = Job::builder()
            .job_type(job_type)
            .parent_id(self.step_id)
            .kind(JobKind::Worker)
            .payload(payload)
            .metadata(JobMetadata {
                manager_id: Some(self.manager_id),
                step_id: Some(self.step_id),
                step_name: Some(self.step_name.clone()),
                ..Default::default()
            })
            .build();
        self.dispatcher.enqueue(job).await
    }
}

#[async_trait]
pub trait StepManager: Send + Sync + 'static {
    /// Step type this manager handles.
    fn step_type(&self) -> &str;

    /// Whether the orchestrator should wait for children of this step.
    fn returns_child_jobs(&self) -> bool;

    /// Checked at trigger time, before any job exists.
    fn validate_config(&self, _step: &StepDefinition) -> anyhow::Result<()> {
        Ok(())
    }

    /// Initializes the step and enqueues its children (possibly none).
    ///
    /// Returns the id of the step job the children hang off, normally
    /// `ctx.step_id()`.
    async fn create_parent_job(
        &self,
        ctx: &StepContext,
        step: &StepDefinition,
        definition: &JobDefinition,
    ) -> anyhow::Result<JobId>;
}

/// Step type -> manager lookup.
#[derive(Default, Clone)]
pub struct StepManagerRegistry {
    managers: HashMap<String, Arc<dyn StepManager>>,
}

impl StepManagerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<M: StepManager>(&mut self, manager: M) -> Result<()> {
        self.register_arc(Arc::new(manager))
    }

    pub fn register_arc(&mut self, manager: Arc<dyn StepManager>) -> Result<()> {
        let step_type = manager.step_type().to_string();
        if self.managers.contains_key(&step_type) {
            return Err(JobflowError::StepManagerAlreadyRegistered(step_type));
        }
        self.managers.insert(step_type, manager);
        Ok(())
    }

    pub fn get(&self, step_type: &str) -> Option<Arc<dyn StepManager>> {
        self.managers.get(step_type).cloned()
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }
}

impl std::fmt::Debug for StepManagerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.managers.keys().collect();
        types.sort();
        f.debug_struct("StepManagerRegistry")
            .field("types", &types)
            .finish()
    }
}

// =============================================================================
// Fan-out
// =============================================================================

/// Spawns one worker job per entry of the step's `items` config array.
///
/// Each child's payload is `{"item": <entry>, "config": <step config>}`. A
/// step without `items`, or with an empty array, spawns nothing and is closed
/// by the step monitor's zero-children grace period.
#[derive(Debug, Clone)]
pub struct FanOutStepManager {
    step_type: String,
    worker_type: String,
}

impl FanOutStepManager {
    pub fn new(step_type: impl Into<String>, worker_type: impl Into<String>) -> Self {
        Self {
            step_type: step_type.into(),
            worker_type: worker_type.into(),
        }
    }
}

#[async_trait]
impl StepManager for FanOutStepManager {
    fn step_type(&self) -> &str {
        &self.step_type
    }

    fn returns_child_jobs(&self) -> bool {
        true
    }

    fn validate_config(&self, step: &StepDefinition) -> anyhow::Result<()> {
        match step.config.get("items") {
            None | Some(Value::Array(_)) => Ok(()),
            Some(other) => bail!("items must be an array, got {other}"),
        }
    }

    async fn create_parent_job(
        &self,
        ctx: &StepContext,
        step: &StepDefinition,
        _definition: &JobDefinition,
    ) -> anyhow::Result<JobId> {
        let items: &[Value] = match step.config.get("items") {
            Some(Value::Array(items)) => items.as_slice(),
            _ => &[],
        };
        let config = Value::Object(step.config.clone());

        ctx.log(
            LogLevel::Info,
            format!("Spawning {} {} jobs", items.len(), self.worker_type),
        )
        .await?;

        for item in items {
            ctx.spawn_child(
                self.worker_type.clone(),
                json!({ "item": item, "config": config }),
            )
            .await
            .with_context(|| format!("failed to enqueue {} job", self.worker_type))?;
        }
        Ok(ctx.step_id())
    }
}
