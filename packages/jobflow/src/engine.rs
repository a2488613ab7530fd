//! The assembled engine: one object owning the store, bus, worker pool,
//! orchestrator and monitors.
//!
//! ```text
//! Engine
//!   ├── JobStatusManager ── JobStore (in-memory by default)
//!   │        └── EventBus ──► NotificationGateway ──► StreamHub topics
//!   ├── Dispatcher ── JobQueue ──► Worker × concurrency
//!   ├── Orchestrator ── StepManagerRegistry
//!   └── StaleJobDetector
//! ```
//!
//! Build with [`Engine::builder`], call [`Engine::start`] once inside a tokio
//! runtime, and [`Engine::shutdown`] on the way out.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::{EventBus, EventHandler};
use crate::config::EngineConfig;
use crate::definition::JobDefinition;
use crate::dispatcher::{Dispatcher, Worker};
use crate::error::Result;
use crate::events::JobEvent;
use crate::gateway::NotificationGateway;
use crate::hub::StreamHub;
use crate::job::{Job, JobFilter, JobId, JobKind};
use crate::log::{LogEntry, LogLevel};
use crate::monitor::StaleJobDetector;
use crate::orchestrator::Orchestrator;
use crate::queue::{InMemoryJobQueue, JobQueue};
use crate::status::JobStatusManager;
use crate::step::{StepManager, StepManagerRegistry};
use crate::store::{InMemoryJobStore, JobStore};

// =============================================================================
// Builder
// =============================================================================

pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn JobStore>>,
    queue: Option<Arc<dyn JobQueue>>,
    hub: Option<StreamHub>,
    workers: Vec<Arc<dyn Worker>>,
    step_managers: Vec<Arc<dyn StepManager>>,
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EngineBuilder {
    fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            store: None,
            queue: None,
            hub: None,
            workers: Vec::new(),
            step_managers: Vec::new(),
            handlers: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Hub the notification gateway publishes to. A private one is created
    /// otherwise.
    pub fn with_hub(mut self, hub: StreamHub) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn with_worker<W: Worker>(mut self, worker: W) -> Self {
        self.workers.push(Arc::new(worker));
        self
    }

    pub fn with_step_manager<M: StepManager>(mut self, manager: M) -> Self {
        self.step_managers.push(Arc::new(manager));
        self
    }

    /// Extra event handler, invoked alongside the notification gateway.
    pub fn with_handler<H: EventHandler>(mut self, handler: H) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Wires everything together. Fails on duplicate worker or step types.
    pub fn build(self) -> Result<Engine> {
        let config = self.config.normalized();
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryJobStore::new()));
        let queue = self
            .queue
            .unwrap_or_else(|| Arc::new(InMemoryJobQueue::new()));
        let hub = self.hub.unwrap_or_default();

        let bus = EventBus::new();
        bus.subscribe(NotificationGateway::new(hub.clone()));
        for handler in self.handlers {
            bus.subscribe_arc(handler);
        }

        let status = JobStatusManager::new(store, bus);
        let dispatcher = Dispatcher::new(status.clone(), queue, config.clone());
        status.bus().subscribe(dispatcher.stop_handler());
        for worker in self.workers {
            dispatcher.register_arc(worker)?;
        }

        let mut steps = StepManagerRegistry::new();
        for manager in self.step_managers {
            steps.register_arc(manager)?;
        }

        let shutdown = CancellationToken::new();
        let orchestrator = Orchestrator::new(
            status.clone(),
            dispatcher.clone(),
            steps,
            config.clone(),
            shutdown.clone(),
        );

        Ok(Engine {
            inner: Arc::new(EngineInner {
                status,
                dispatcher,
                orchestrator,
                hub,
                config,
                shutdown,
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }
}

// =============================================================================
// Engine
// =============================================================================

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    status: JobStatusManager,
    dispatcher: Dispatcher,
    orchestrator: Orchestrator,
    hub: StreamHub,
    config: EngineConfig,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Spawns the worker loops and the stale job detector. Calling it again
    /// while running does nothing.
    pub fn start(&self) {
        let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if !tasks.is_empty() {
            warn!("engine already started");
            return;
        }

        tasks.extend(self.inner.dispatcher.start(self.inner.shutdown.clone()));
        tasks.push(
            StaleJobDetector::new(self.inner.status.clone(), &self.inner.config)
                .with_dispatcher(self.inner.dispatcher.clone())
                .spawn(self.inner.shutdown.clone()),
        );
        info!(
            concurrency = self.inner.config.concurrency,
            "engine started"
        );
    }

    /// Stops accepting work and waits up to `grace` for background tasks.
    ///
    /// Pipelines still running are cancelled; workers see their cancellation
    /// token fire. Returns `false` if some task outlived the grace period.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.inner.shutdown.cancel();
        let tasks: Vec<_> = {
            let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };

        let clean = tokio::time::timeout(grace, futures::future::join_all(tasks))
            .await
            .is_ok();
        if clean {
            info!("engine stopped");
        } else {
            warn!(grace_ms = grace.as_millis() as u64, "engine shutdown timed out");
        }
        clean
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    // =========================================================================
    // Pipelines
    // =========================================================================

    /// Validates a definition and starts it in the background.
    pub async fn trigger(&self, definition: &JobDefinition) -> Result<JobId> {
        self.inner.orchestrator.trigger(definition).await
    }

    /// Runs a definition to completion and returns the finished manager job.
    pub async fn run(&self, definition: &JobDefinition) -> Result<Job> {
        self.inner.orchestrator.run(definition).await
    }

    /// Starts a new run of a previous pipeline.
    pub async fn rerun_job(&self, job_id: JobId) -> Result<JobId> {
        self.inner.orchestrator.rerun(job_id).await
    }

    // =========================================================================
    // Jobs
    // =========================================================================

    /// Enqueues a standalone worker job.
    pub async fn submit(&self, job_type: impl Into<String>, payload: Value) -> Result<JobId> {
        let job = Job::builder()
            .job_type(job_type)
            .kind(JobKind::Worker)
            .payload(payload)
            .build();
        self.inner.dispatcher.enqueue(job).await
    }

    pub fn register_worker<W: Worker>(&self, worker: W) -> Result<()> {
        self.inner.dispatcher.register(worker)
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Job> {
        self.inner.status.get_job(job_id).await
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        self.inner.status.list_jobs(filter).await
    }

    pub async fn job_logs(&self, job_id: JobId, min_level: Option<LogLevel>) -> Result<Vec<LogEntry>> {
        // Fail on unknown ids rather than returning an empty list.
        self.inner.status.get_job(job_id).await?;
        self.inner.status.logs(job_id, min_level).await
    }

    /// Cancels a job and everything under it.
    ///
    /// A pipeline stops before its next step, step monitors stop waiting and
    /// running workers see their cancellation token fire. Returns the ids
    /// moved to `cancelled`.
    pub async fn cancel_job(&self, job_id: JobId) -> Result<Vec<JobId>> {
        self.inner.orchestrator.cancel(job_id);
        let cancelled = self.inner.status.cancel_job_tree(job_id).await?;
        for id in &cancelled {
            self.inner.dispatcher.cancel(*id);
        }
        info!(job_id = %job_id, count = cancelled.len(), "job tree cancelled");
        Ok(cancelled)
    }

    // =========================================================================
    // Observation
    // =========================================================================

    /// Ordered stream of every event published after this call.
    pub fn events(&self) -> tokio::sync::broadcast::Receiver<JobEvent> {
        self.inner.status.bus().stream()
    }

    pub fn bus(&self) -> &EventBus {
        self.inner.status.bus()
    }

    pub fn hub(&self) -> &StreamHub {
        &self.inner.hub
    }

    pub fn status(&self) -> &JobStatusManager {
        &self.inner.status
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .field("dispatcher", &self.inner.dispatcher)
            .field("orchestrator", &self.inner.orchestrator)
            .finish_non_exhaustive()
    }
}
