//! Worker pool.
//!
//! The `Dispatcher` runs `concurrency` identical loops over one shared queue:
//!
//! ```text
//! loop (× concurrency)
//!     │
//!     ├─► dequeue job id (idle backoff min..max poll interval)
//!     ├─► skip if job already terminal (cancelled while queued)
//!     ├─► mark running, start heartbeat task
//!     ├─► Worker.execute(ctx, job)  ── inside catch_unwind
//!     └─► completed / failed
//!             └─► children spawned? hand off to JobMonitor instead
//! ```
//!
//! A panicking worker fails its own job; the loop keeps dequeuing.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use anyhow::anyhow;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::EventHandler;
use crate::config::EngineConfig;
use crate::error::{JobflowError, Result};
use crate::events::{JobEvent, JobEventKind};
use crate::job::{Job, JobId, JobKind, JobMetadata, JobStatus};
use crate::log::LogLevel;
use crate::monitor::JobMonitor;
use crate::queue::JobQueue;
use crate::status::JobStatusManager;

// =============================================================================
// Worker
// =============================================================================

/// Performs the actual work for one job type.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    /// Job type this worker is registered under.
    fn job_type(&self) -> &str;

    /// Rejects unusable payloads before a job is created.
    fn validate(&self, _payload: &Value) -> anyhow::Result<()> {
        Ok(())
    }

    /// Does the work. Long-running workers should watch
    /// [`WorkerContext::cancellation`] and return promptly once it fires.
    async fn execute(&self, ctx: &WorkerContext, job: &Job) -> anyhow::Result<()>;
}

/// Handle given to a worker for the job it is executing.
pub struct WorkerContext {
    job_id: JobId,
    manager_id: Option<JobId>,
    step_id: Option<JobId>,
    step_name: Option<String>,
    dispatcher: Dispatcher,
    cancel: CancellationToken,
    spawned: AtomicU64,
}

impl WorkerContext {
    fn new(job: &Job, dispatcher: Dispatcher, cancel: CancellationToken) -> Self {
        Self {
            job_id: job.id,
            manager_id: job.metadata.manager_id,
            step_id: job.metadata.step_id,
            step_name: job.metadata.step_name.clone(),
            dispatcher,
            cancel,
            spawned: AtomicU64::new(0),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn manager_id(&self) -> Option<JobId> {
        self.manager_id
    }

    /// Fires when the job is cancelled or the dispatcher shuts down.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn heartbeat(&self) -> Result<()> {
        self.dispatcher.status().heartbeat(self.job_id).await
    }

    pub async fn log(&self, level: LogLevel, message: impl Into<String>) -> Result<()> {
        self.dispatcher
            .status()
            .add_job_log(self.job_id, level, message)
            .await
    }

    /// Counts `count` documents on this job, its step and its pipeline.
    pub async fn add_documents(&self, count: u64) -> Result<()> {
        let status = self.dispatcher.status();
        status.increment_document_count(self.job_id, count).await?;
        for ancestor in [self.step_id, self.manager_id].into_iter().flatten() {
            if ancestor != self.job_id {
                status.increment_document_count(ancestor, count).await?;
            }
        }
        Ok(())
    }

    pub async fn add_results(&self, count: u64) -> Result<()> {
        self.dispatcher
            .status()
            .increment_result_count(self.job_id, count)
            .await
            .map(|_| ())
    }

    /// Enqueues a child of this job. A job that spawned children is completed
    /// by the job monitor once they are all terminal, not when `execute`
    /// returns.
    pub async fn spawn_child(&self, job_type: impl Into<String>, payload: Value) -> Result<JobId> {
        let child = Job::builder()
            .job_type(job_type)
            .parent_id(self.job_id)
            .kind(JobKind::Worker)
            .payload(payload)
            .metadata(JobMetadata {
                manager_id: self.manager_id,
                step_id: self.step_id,
                step_name: self.step_name.clone(),
                ..Default::default()
            })
            .build();

        if self.cancel.is_cancelled() {
            return Err(JobflowError::ParentTerminal {
                parent: self.job_id,
                status: JobStatus::Cancelled,
            });
        }

        let id = self.dispatcher.enqueue(child).await?;
        self.spawned.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    pub fn spawned_children(&self) -> u64 {
        self.spawned.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    workers: RwLock<HashMap<String, Arc<dyn Worker>>>,
    queue: Arc<dyn JobQueue>,
    status: JobStatusManager,
    config: EngineConfig,
    /// Cancellation handles of jobs currently executing
    running: DashMap<JobId, CancellationToken>,
}

impl Dispatcher {
    pub fn new(status: JobStatusManager, queue: Arc<dyn JobQueue>, config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                workers: RwLock::new(HashMap::new()),
                queue,
                status,
                config,
                running: DashMap::new(),
            }),
        }
    }

    pub fn status(&self) -> &JobStatusManager {
        &self.inner.status
    }

    /// Registers a worker, failing if its job type is taken.
    pub fn register<W: Worker>(&self, worker: W) -> Result<()> {
        self.register_arc(Arc::new(worker))
    }

    pub fn register_arc(&self, worker: Arc<dyn Worker>) -> Result<()> {
        let mut workers = self
            .inner
            .workers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let job_type = worker.job_type().to_string();
        if workers.contains_key(&job_type) {
            return Err(JobflowError::WorkerAlreadyRegistered(job_type));
        }
        debug!(job_type = %job_type, "worker registered");
        workers.insert(job_type, worker);
        Ok(())
    }

    pub fn has_worker(&self, job_type: &str) -> bool {
        self.worker(job_type).is_some()
    }

    fn worker(&self, job_type: &str) -> Option<Arc<dyn Worker>> {
        self.inner
            .workers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_type)
            .cloned()
    }

    /// Validates, persists and queues a job.
    pub async fn enqueue(&self, job: Job) -> Result<JobId> {
        let worker = self
            .worker(&job.job_type)
            .ok_or_else(|| JobflowError::UnknownWorkerType(job.job_type.clone()))?;
        worker
            .validate(&job.payload)
            .map_err(|e| JobflowError::InvalidPayload {
                job_type: job.job_type.clone(),
                reason: format!("{e:#}"),
            })?;

        let job = self.inner.status.create_job(job).await?;
        if let Err(e) = self.inner.queue.enqueue(job.id).await {
            let message = format!("enqueue failed: {e:#}");
            if let Err(e) = self
                .inner
                .status
                .update_job_status(job.id, JobStatus::Failed, Some(message.clone()))
                .await
            {
                error!(job_id = %job.id, error = %e, "failed to mark unqueued job as failed");
            }
            return Err(JobflowError::Queue(message));
        }
        Ok(job.id)
    }

    /// Signals a running job to stop. Returns `false` if it is not executing.
    pub fn cancel(&self, job_id: JobId) -> bool {
        match self.inner.running.get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Event handler that signals a running worker once its job is cancelled
    /// or failed by someone else.
    pub fn stop_handler(&self) -> StopRunningWorker {
        StopRunningWorker {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn running_count(&self) -> usize {
        self.inner.running.len()
    }

    /// Spawns the dispatch loops. They exit when `shutdown` fires.
    pub fn start(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        info!(concurrency = self.inner.config.concurrency, "dispatcher starting");
        (0..self.inner.config.concurrency)
            .map(|slot| {
                let dispatcher = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { dispatcher.run_loop(slot, shutdown).await })
            })
            .collect()
    }

    async fn run_loop(self, slot: usize, shutdown: CancellationToken) {
        let min_wait = self.inner.config.min_poll_interval;
        let max_wait = self.inner.config.max_poll_interval;
        let mut wait = min_wait;

        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = self.inner.queue.dequeue(wait) => next,
            };

            match next {
                Ok(Some(job_id)) => {
                    wait = min_wait;
                    self.process(job_id, &shutdown).await;
                }
                Ok(None) => {
                    wait = (wait * 2).min(max_wait);
                }
                Err(e) => {
                    error!(slot, error = %e, "failed to dequeue");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(max_wait) => {}
                    }
                }
            }
        }

        debug!(slot, "dispatcher loop stopped");
    }

    async fn process(&self, job_id: JobId, shutdown: &CancellationToken) {
        let status = &self.inner.status;

        let job = match status.find_job(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(job_id = %job_id, "dequeued unknown job");
                return;
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "failed to load dequeued job");
                return;
            }
        };

        if job.is_terminal() {
            debug!(job_id = %job_id, status = %job.status, "skipping terminal job");
            return;
        }

        if let Some(parent_status) = self.stopped_parent(&job).await {
            debug!(
                job_id = %job_id,
                parent = %parent_status,
                "parent stopped, cancelling queued child"
            );
            self.mark(job_id, JobStatus::Cancelled, None).await;
            return;
        }

        let Some(worker) = self.worker(&job.job_type) else {
            let message = format!("no worker registered for job type {}", job.job_type);
            self.mark(job_id, JobStatus::Failed, Some(message)).await;
            return;
        };

        match status.update_job_status(job_id, JobStatus::Running, None).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(job_id = %job_id, "job changed before start, skipping");
                return;
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "failed to mark job running");
                return;
            }
        }

        let cancel = shutdown.child_token();
        self.inner.running.insert(job_id, cancel.clone());

        let ctx = WorkerContext::new(&job, self.clone(), cancel);
        let result = self.execute_with_heartbeat(worker, &ctx, &job).await;

        self.inner.running.remove(&job_id);

        match result {
            Ok(()) if ctx.spawned_children() > 0 => {
                debug!(
                    job_id = %job_id,
                    children = ctx.spawned_children(),
                    "worker spawned children, job monitor will finalize"
                );
                JobMonitor::new(status.clone(), &self.inner.config)
                    .spawn_finalizer(job_id, shutdown.clone());
            }
            Ok(()) => {
                debug!(job_id = %job_id, job_type = %job.job_type, "job succeeded");
                self.mark(job_id, JobStatus::Completed, None).await;
            }
            Err(e) => {
                let message = if shutdown.is_cancelled() {
                    format!("interrupted by shutdown: {e:#}")
                } else {
                    format!("{e:#}")
                };
                warn!(job_id = %job_id, job_type = %job.job_type, error = %message, "job failed");
                self.mark(job_id, JobStatus::Failed, Some(message)).await;
            }
        }
    }

    /// Runs the worker with periodic heartbeats, converting panics to errors.
    async fn execute_with_heartbeat(
        &self,
        worker: Arc<dyn Worker>,
        ctx: &WorkerContext,
        job: &Job,
    ) -> anyhow::Result<()> {
        let status = self.inner.status.clone();
        let job_id = job.id;
        let heartbeat_interval = self.inner.config.heartbeat_interval;

        let stop = CancellationToken::new();
        let heartbeat_stop = stop.clone();
        let heartbeat_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            interval.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = heartbeat_stop.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = status.heartbeat(job_id).await {
                            warn!(job_id = %job_id, error = %e, "heartbeat failed");
                        }
                    }
                }
            }
        });

        // AssertUnwindSafe is required because worker/ctx are not UnwindSafe
        let result = AssertUnwindSafe(worker.execute(ctx, job))
            .catch_unwind()
            .await;

        stop.cancel();
        let _ = heartbeat_handle.await;

        match result {
            Ok(inner) => inner,
            Err(panic_info) => {
                let panic_msg = panic_message(&panic_info);
                error!(job_id = %job_id, panic = %panic_msg, "worker panicked");
                Err(anyhow!("worker panicked: {}", panic_msg))
            }
        }
    }

    /// Status of the job's parent when it was cancelled or failed.
    async fn stopped_parent(&self, job: &Job) -> Option<JobStatus> {
        let parent_id = job.parent_id?;
        match self.inner.status.find_job(parent_id).await {
            Ok(Some(parent))
                if matches!(parent.status, JobStatus::Cancelled | JobStatus::Failed) =>
            {
                Some(parent.status)
            }
            Ok(_) => None,
            Err(e) => {
                warn!(
                    job_id = %job.id,
                    parent_id = %parent_id,
                    error = %e,
                    "failed to load parent job"
                );
                None
            }
        }
    }

    async fn mark(&self, job_id: JobId, to: JobStatus, error: Option<String>) {
        if let Err(e) = self.inner.status.update_job_status(job_id, to, error).await {
            error!(job_id = %job_id, status = %to, error = %e, "failed to record job outcome");
        }
    }
}

/// See [`Dispatcher::stop_handler`]. Holds the dispatcher weakly, since the
/// dispatcher owns the bus it is subscribed to.
pub struct StopRunningWorker {
    inner: Weak<DispatcherInner>,
}

#[async_trait]
impl EventHandler for StopRunningWorker {
    fn name(&self) -> &'static str {
        "stop_running_worker"
    }

    async fn handle(&self, event: &JobEvent) -> anyhow::Result<()> {
        if !matches!(event.kind, JobEventKind::JobCancelled | JobEventKind::JobFailed) {
            return Ok(());
        }
        let Some(inner) = self.inner.upgrade() else {
            return Ok(());
        };
        if let Some(token) = inner.running.get(&event.job_id) {
            debug!(job_id = %event.job_id, kind = event.kind.as_str(), "stopping running worker");
            token.cancel();
        }
        Ok(())
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let worker_count = self
            .inner
            .workers
            .read()
            .map(|w| w.len())
            .unwrap_or_default();
        f.debug_struct("Dispatcher")
            .field("worker_count", &worker_count)
            .field("running", &self.inner.running.len())
            .finish_non_exhaustive()
    }
}

/// Extract a human-readable message from a panic payload.
pub(crate) fn panic_message(panic_info: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::queue::InMemoryJobQueue;
    use crate::store::InMemoryJobStore;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn dispatcher(concurrency: usize) -> Dispatcher {
        let status = JobStatusManager::new(Arc::new(InMemoryJobStore::new()), EventBus::new());
        Dispatcher::new(
            status,
            Arc::new(InMemoryJobQueue::new()),
            EngineConfig::fast().with_concurrency(concurrency),
        )
    }

    async fn wait_terminal(dispatcher: &Dispatcher, id: JobId) -> Job {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let job = dispatcher.status().get_job(id).await.unwrap();
                if job.is_terminal() {
                    return job;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("job never reached a terminal status")
    }

    struct Echo;

    #[async_trait]
    impl Worker for Echo {
        fn job_type(&self) -> &str {
            "echo"
        }

        fn validate(&self, payload: &Value) -> anyhow::Result<()> {
            if payload.get("reject").is_some() {
                anyhow::bail!("rejected payload");
            }
            Ok(())
        }

        async fn execute(&self, ctx: &WorkerContext, job: &Job) -> anyhow::Result<()> {
            if job.payload.get("fail").is_some() {
                anyhow::bail!("asked to fail");
            }
            ctx.add_documents(1).await?;
            Ok(())
        }
    }

    struct Panicky;

    #[async_trait]
    impl Worker for Panicky {
        fn job_type(&self) -> &str {
            "panicky"
        }

        async fn execute(&self, _ctx: &WorkerContext, _job: &Job) -> anyhow::Result<()> {
            panic!("kaboom");
        }
    }

    struct WaitsForCancel {
        started: Arc<Notify>,
    }

    #[async_trait]
    impl Worker for WaitsForCancel {
        fn job_type(&self) -> &str {
            "long"
        }

        async fn execute(&self, ctx: &WorkerContext, _job: &Job) -> anyhow::Result<()> {
            self.started.notify_one();
            ctx.cancellation().cancelled().await;
            anyhow::bail!("cancelled")
        }
    }

    struct Spawner;

    #[async_trait]
    impl Worker for Spawner {
        fn job_type(&self) -> &str {
            "spawner"
        }

        async fn execute(&self, ctx: &WorkerContext, _job: &Job) -> anyhow::Result<()> {
            for i in 0..3 {
                ctx.spawn_child("echo", json!({"page": i})).await?;
            }
            Ok(())
        }
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let dispatcher = dispatcher(1);
        dispatcher.register(Echo).unwrap();
        let err = dispatcher.register(Echo).unwrap_err();
        assert!(matches!(err, JobflowError::WorkerAlreadyRegistered(t) if t == "echo"));
    }

    #[tokio::test]
    async fn test_enqueue_validates() {
        let dispatcher = dispatcher(1);
        dispatcher.register(Echo).unwrap();

        let unknown = dispatcher
            .enqueue(Job::builder().job_type("nope").build())
            .await
            .unwrap_err();
        assert!(matches!(unknown, JobflowError::UnknownWorkerType(_)));

        let invalid = dispatcher
            .enqueue(
                Job::builder()
                    .job_type("echo")
                    .payload(json!({"reject": true}))
                    .build(),
            )
            .await
            .unwrap_err();
        assert!(matches!(invalid, JobflowError::InvalidPayload { .. }));
        assert!(dispatcher
            .status()
            .list_jobs(&Default::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_success_and_failure_outcomes() {
        let dispatcher = dispatcher(2);
        dispatcher.register(Echo).unwrap();
        let shutdown = CancellationToken::new();
        dispatcher.start(shutdown.clone());

        let ok = dispatcher
            .enqueue(Job::builder().job_type("echo").build())
            .await
            .unwrap();
        let bad = dispatcher
            .enqueue(
                Job::builder()
                    .job_type("echo")
                    .payload(json!({"fail": true}))
                    .build(),
            )
            .await
            .unwrap();

        let ok = wait_terminal(&dispatcher, ok).await;
        assert_eq!(ok.status, JobStatus::Completed);
        assert_eq!(ok.document_count, 1);
        assert!(ok.started_at.is_some());

        let bad = wait_terminal(&dispatcher, bad).await;
        assert_eq!(bad.status, JobStatus::Failed);
        assert_eq!(bad.error.as_deref(), Some("asked to fail"));

        shutdown.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panic_fails_job_and_loop_survives() {
        // Single loop: if the panic killed it, the echo job would never run.
        let dispatcher = dispatcher(1);
        dispatcher.register(Panicky).unwrap();
        dispatcher.register(Echo).unwrap();
        let shutdown = CancellationToken::new();
        dispatcher.start(shutdown.clone());

        let boom = dispatcher
            .enqueue(Job::builder().job_type("panicky").build())
            .await
            .unwrap();
        let after = dispatcher
            .enqueue(Job::builder().job_type("echo").build())
            .await
            .unwrap();

        let boom = wait_terminal(&dispatcher, boom).await;
        assert_eq!(boom.status, JobStatus::Failed);
        assert!(boom.error.unwrap().contains("kaboom"));

        assert_eq!(
            wait_terminal(&dispatcher, after).await.status,
            JobStatus::Completed
        );
        shutdown.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_while_queued_is_skipped() {
        let dispatcher = dispatcher(1);
        dispatcher.register(Echo).unwrap();

        let id = dispatcher
            .enqueue(Job::builder().job_type("echo").build())
            .await
            .unwrap();
        dispatcher
            .status()
            .update_job_status(id, JobStatus::Cancelled, None)
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        dispatcher.start(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let job = dispatcher.status().get_job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.started_at.is_none());
        shutdown.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_child_of_cancelled_parent_is_skipped() {
        let dispatcher = dispatcher(1);
        dispatcher.register(Echo).unwrap();

        let parent = dispatcher
            .status()
            .create_job(Job::builder().job_type("step").kind(JobKind::Step).build())
            .await
            .unwrap();
        dispatcher
            .status()
            .update_job_status(parent.id, JobStatus::Cancelled, None)
            .await
            .unwrap();
        let child = dispatcher
            .enqueue(Job::builder().job_type("echo").parent_id(parent.id).build())
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        dispatcher.start(shutdown.clone());

        let job = wait_terminal(&dispatcher, child).await;
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.started_at.is_none());
        assert_eq!(job.document_count, 0);
        shutdown.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_signals_running_worker() {
        let dispatcher = dispatcher(1);
        let started = Arc::new(Notify::new());
        dispatcher
            .register(WaitsForCancel {
                started: started.clone(),
            })
            .unwrap();
        let shutdown = CancellationToken::new();
        dispatcher.start(shutdown.clone());

        let id = dispatcher
            .enqueue(Job::builder().job_type("long").build())
            .await
            .unwrap();
        started.notified().await;

        dispatcher
            .status()
            .update_job_status(id, JobStatus::Cancelled, None)
            .await
            .unwrap();
        assert!(dispatcher.cancel(id));

        let job = wait_terminal(&dispatcher, id).await;
        // The late failure from the worker does not override the cancellation.
        assert_eq!(job.status, JobStatus::Cancelled);
        shutdown.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_status_stops_running_worker() {
        let dispatcher = dispatcher(1);
        dispatcher.status().bus().subscribe(dispatcher.stop_handler());
        let started = Arc::new(Notify::new());
        dispatcher
            .register(WaitsForCancel {
                started: started.clone(),
            })
            .unwrap();
        let shutdown = CancellationToken::new();
        dispatcher.start(shutdown.clone());

        let id = dispatcher
            .enqueue(Job::builder().job_type("long").build())
            .await
            .unwrap();
        started.notified().await;
        assert_eq!(dispatcher.running_count(), 1);

        // No direct cancel call: the status change alone reaches the worker.
        dispatcher
            .status()
            .update_job_status(id, JobStatus::Cancelled, None)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while dispatcher.running_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("worker kept running after cancellation");
        assert_eq!(
            dispatcher.status().get_job(id).await.unwrap().status,
            JobStatus::Cancelled
        );
        shutdown.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_worker_with_children_completes_after_them() {
        let dispatcher = dispatcher(2);
        dispatcher.register(Echo).unwrap();
        dispatcher.register(Spawner).unwrap();
        let shutdown = CancellationToken::new();
        dispatcher.start(shutdown.clone());

        let id = dispatcher
            .enqueue(Job::builder().job_type("spawner").build())
            .await
            .unwrap();

        let parent = wait_terminal(&dispatcher, id).await;
        assert_eq!(parent.status, JobStatus::Completed);

        let children = dispatcher.status().children(id).await.unwrap();
        assert_eq!(children.len(), 3);
        for child in children {
            assert_eq!(child.status, JobStatus::Completed);
            assert!(child.completed_at.unwrap() <= parent.completed_at.unwrap());
        }
        shutdown.cancel();
    }
}
