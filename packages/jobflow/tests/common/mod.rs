//! Shared engine harness for integration tests.
//!
//! Run with `RUST_LOG=jobflow=debug cargo test -- --nocapture` to see engine
//! logs.

#![allow(dead_code)]

use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use jobflow::{
    Engine, EngineBuilder, EngineConfig, FanOutStepManager, Job, JobFilter, JobId, StepDefinition,
    Worker, WorkerContext,
};
use serde_json::Value;

pub const ITEM_WORKER: &str = "item";
pub const FAN_OUT: &str = "fan_out";

/// Processes one fan-out item.
///
/// Items are JSON objects: `{"fail": true}` makes the job fail,
/// `{"sleep_ms": n}` makes it wait (returning early on cancellation).
pub struct ItemWorker;

#[async_trait]
impl Worker for ItemWorker {
    fn job_type(&self) -> &str {
        ITEM_WORKER
    }

    async fn execute(&self, ctx: &WorkerContext, job: &Job) -> anyhow::Result<()> {
        let item = &job.payload["item"];

        if let Some(ms) = item.get("sleep_ms").and_then(Value::as_u64) {
            tokio::select! {
                _ = ctx.cancellation().cancelled() => bail!("cancelled"),
                _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
            }
        }
        if item.get("fail").and_then(Value::as_bool).unwrap_or(false) {
            bail!("item refused");
        }
        ctx.add_documents(1).await?;
        Ok(())
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A started engine with the item worker and the fan-out step type.
pub fn engine() -> Engine {
    engine_with(EngineConfig::fast())
}

pub fn engine_with(config: EngineConfig) -> Engine {
    start(engine_builder(config))
}

/// Builder with the item worker and the fan-out step type registered, for
/// tests that add their own step managers.
pub fn engine_builder(config: EngineConfig) -> EngineBuilder {
    init_tracing();
    Engine::builder()
        .with_config(config)
        .with_worker(ItemWorker)
        .with_step_manager(FanOutStepManager::new(FAN_OUT, ITEM_WORKER))
}

pub fn start(builder: EngineBuilder) -> Engine {
    let engine = builder.build().expect("engine should build");
    engine.start();
    engine
}

/// Fan-out step with one child per item.
pub fn fan_out(name: &str, items: Vec<Value>) -> StepDefinition {
    StepDefinition::new(name, FAN_OUT).with_config("items", Value::Array(items))
}

pub async fn wait_for_terminal(engine: &Engine, id: JobId) -> Job {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let job = engine.get_job(id).await.expect("job exists");
            if job.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job never reached a terminal status")
}

/// Step jobs of a pipeline, by step name.
pub async fn step_job(engine: &Engine, manager_id: JobId, name: &str) -> Option<Job> {
    engine
        .list_jobs(&JobFilter::children_of(manager_id))
        .await
        .expect("list steps")
        .into_iter()
        .find(|job| job.step_name() == Some(name))
}

pub async fn children(engine: &Engine, parent_id: JobId) -> Vec<Job> {
    engine
        .list_jobs(&JobFilter::children_of(parent_id))
        .await
        .expect("list children")
}
