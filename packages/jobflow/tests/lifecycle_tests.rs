//! Cancellation, reruns and what observers get to see.

mod common;

use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use common::*;
use jobflow::hub::{pipeline_topic, ALL_JOBS_TOPIC};
use jobflow::{
    EngineConfig, JobDefinition, JobFilter, JobId, JobKind, JobStatus, JobflowError, LogLevel,
    StepContext, StepDefinition, StepManager,
};
use serde_json::{json, Value};

const TRICKLE: &str = "trickle";

/// Enqueues `count` item jobs, `delay_ms` apart, then gives up with an error
/// when `fail_after` is set.
struct TrickleStepManager;

#[async_trait]
impl StepManager for TrickleStepManager {
    fn step_type(&self) -> &str {
        TRICKLE
    }

    fn returns_child_jobs(&self) -> bool {
        true
    }

    async fn create_parent_job(
        &self,
        ctx: &StepContext,
        step: &StepDefinition,
        _definition: &JobDefinition,
    ) -> anyhow::Result<JobId> {
        let count = step.config.get("count").and_then(Value::as_u64).unwrap_or(0);
        let delay = step.config.get("delay_ms").and_then(Value::as_u64).unwrap_or(0);
        let item = step.config.get("item").cloned().unwrap_or_else(|| json!({}));

        for _ in 0..count {
            ctx.spawn_child(ITEM_WORKER, json!({ "item": item })).await?;
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if step.config.get("fail_after").and_then(Value::as_bool).unwrap_or(false) {
            bail!("source went away");
        }
        Ok(ctx.step_id())
    }
}

fn trickle_engine() -> jobflow::Engine {
    start(engine_builder(EngineConfig::fast()).with_step_manager(TrickleStepManager))
}

async fn wait_for_step(engine: &jobflow::Engine, manager_id: JobId, name: &str) -> jobflow::Job {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(step) = step_job(engine, manager_id, name).await {
                return step;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("step never created")
}

async fn wait_until_running(engine: &jobflow::Engine, parent: jobflow::JobId, count: usize) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let running = children(engine, parent)
                .await
                .iter()
                .filter(|job| job.status == JobStatus::Running)
                .count();
            if running >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("children never started");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_stops_pipeline_before_next_step() {
    let engine = engine();
    let slow = vec![json!({ "sleep_ms": 10_000 }), json!({ "sleep_ms": 10_000 })];
    let definition = JobDefinition::new("slow")
        .step(fan_out("a", slow))
        .step(fan_out("b", vec![json!({})]).depends_on("a"));

    let manager_id = engine.trigger(&definition).await.unwrap();
    let step_a = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(step) = step_job(&engine, manager_id, "a").await {
                return step;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    wait_until_running(&engine, step_a.id, 2).await;

    let cancelled = engine.cancel_job(manager_id).await.unwrap();
    assert_eq!(cancelled[0], manager_id);
    assert!(cancelled.contains(&step_a.id));

    let manager = wait_for_terminal(&engine, manager_id).await;
    assert_eq!(manager.status, JobStatus::Cancelled);

    // Give the orchestrator time to notice; it must not start b.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(step_job(&engine, manager_id, "b").await.is_none());
    for child in children(&engine, step_a.id).await {
        assert_eq!(child.status, JobStatus::Cancelled);
    }

    // Terminal jobs stay terminal.
    assert!(engine.cancel_job(manager_id).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_while_step_is_still_enqueuing() {
    let engine = trickle_engine();
    let definition = JobDefinition::new("trickle").step(
        StepDefinition::new("a", TRICKLE)
            .with_config("count", 5)
            .with_config("delay_ms", 100)
            .with_config("item", json!({ "sleep_ms": 400 })),
    );

    let manager_id = engine.trigger(&definition).await.unwrap();
    let step = wait_for_step(&engine, manager_id, "a").await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    engine.cancel_job(manager_id).await.unwrap();

    let manager = wait_for_terminal(&engine, manager_id).await;
    assert_eq!(manager.status, JobStatus::Cancelled);

    // Outlast the rest of the manager's enqueue schedule.
    tokio::time::sleep(Duration::from_millis(700)).await;

    let step = engine.get_job(step.id).await.unwrap();
    assert_eq!(step.status, JobStatus::Cancelled);

    let spawned = children(&engine, step.id).await;
    assert!(!spawned.is_empty());
    assert!(spawned.len() < 5, "enqueued {} children", spawned.len());
    for child in &spawned {
        assert_eq!(child.status, JobStatus::Cancelled, "child {}", child.id);
    }
    assert_eq!(engine.get_job(manager_id).await.unwrap().document_count, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_step_init_cancels_enqueued_children() {
    let engine = trickle_engine();
    let definition = JobDefinition::new("flaky").step(
        StepDefinition::new("a", TRICKLE)
            .with_config("count", 2)
            .with_config("item", json!({ "sleep_ms": 300 }))
            .with_config("fail_after", true),
    );

    let manager = engine.run(&definition).await.unwrap();
    assert_eq!(manager.status, JobStatus::Failed);
    assert!(manager.error.unwrap().contains("source went away"));
    assert_eq!(manager.metadata.step_stats[0].status, JobStatus::Failed);

    // Long enough for the children to have finished had they kept running.
    tokio::time::sleep(Duration::from_millis(600)).await;

    let step = step_job(&engine, manager.id, "a").await.unwrap();
    assert_eq!(step.status, JobStatus::Failed);
    let spawned = children(&engine, step.id).await;
    assert_eq!(spawned.len(), 2);
    for child in &spawned {
        assert_eq!(child.status, JobStatus::Cancelled, "child {}", child.id);
    }
    assert_eq!(engine.get_job(manager.id).await.unwrap().document_count, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rerun_starts_fresh_run_from_snapshot() {
    let engine = engine();
    let definition = JobDefinition::new("again").step(fan_out("a", vec![json!({}), json!({})]));

    let first = engine.run(&definition).await.unwrap();
    let rerun_id = engine.rerun_job(first.id).await.unwrap();
    assert_ne!(rerun_id, first.id);

    let rerun = wait_for_terminal(&engine, rerun_id).await;
    assert_eq!(rerun.status, JobStatus::Completed);
    assert_eq!(rerun.metadata.rerun_of, Some(first.id));
    assert_eq!(rerun.payload["definition"], first.payload["definition"]);

    let roots = engine.list_jobs(&JobFilter::roots()).await.unwrap();
    assert_eq!(roots.len(), 2);
    assert!(roots.iter().all(|job| job.kind == JobKind::Manager));

    // The first run is untouched.
    let first_again = engine.get_job(first.id).await.unwrap();
    assert_eq!(first_again.completed_at, first.completed_at);
    assert_eq!(children(&engine, first.id).await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rerun_of_unknown_job_is_not_found() {
    let engine = engine();
    let err = engine.rerun_job(jobflow::JobId::new()).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn list_filters_by_status() {
    let engine = engine();
    let ok = JobDefinition::new("ok").step(fan_out("a", vec![json!({})]));
    let bad = JobDefinition::new("bad").step(fan_out("a", vec![json!({ "fail": true })]));

    let ok = engine.run(&ok).await.unwrap();
    let bad = engine.run(&bad).await.unwrap();

    let failed_roots = engine
        .list_jobs(&JobFilter::roots().with_statuses([JobStatus::Failed]))
        .await
        .unwrap();
    assert_eq!(failed_roots.len(), 1);
    assert_eq!(failed_roots[0].id, bad.id);

    let completed_roots = engine
        .list_jobs(&JobFilter::roots().with_statuses([JobStatus::Completed]))
        .await
        .unwrap();
    assert_eq!(completed_roots[0].id, ok.id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn observers_only_see_info_and_above() {
    let engine = engine();
    let mut all = engine.hub().subscribe(ALL_JOBS_TOPIC).await;

    let definition = JobDefinition::new("observed").step(fan_out("a", vec![json!({})]));
    let manager = engine.run(&definition).await.unwrap();

    // Handlers run on spawned tasks; let them drain.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut forwarded: Vec<Value> = Vec::new();
    while let Ok(value) = all.try_recv() {
        forwarded.push(value);
    }

    let logs: Vec<&Value> = forwarded
        .iter()
        .filter(|v| v["type"] == "job_log")
        .collect();
    assert!(!logs.is_empty());
    assert!(logs
        .iter()
        .all(|v| v["level"] != "debug" && v["level"] != "trace"));
    assert!(forwarded
        .iter()
        .any(|v| v["type"] == "job_completed" && v["job_id"] == manager.id.to_string()));

    // Worker status chatter is persisted at debug level nonetheless.
    let step = step_job(&engine, manager.id, "a").await.unwrap();
    let worker = &children(&engine, step.id).await[0];
    let worker_logs = engine.job_logs(worker.id, None).await.unwrap();
    assert!(worker_logs.iter().any(|entry| entry.level == LogLevel::Debug));
    assert!(engine
        .job_logs(worker.id, Some(LogLevel::Info))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pipeline_topic_carries_step_and_worker_events() {
    let engine = engine();
    // Slow enough that the step cannot finish before we subscribe.
    let definition =
        JobDefinition::new("topic").step(fan_out("a", vec![json!({ "sleep_ms": 300 })]));
    let manager_id = engine.trigger(&definition).await.unwrap();
    let mut topic = engine.hub().subscribe(&pipeline_topic(manager_id)).await;

    let manager = wait_for_terminal(&engine, manager_id).await;
    assert_eq!(manager.status, JobStatus::Completed);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut originators = Vec::new();
    while let Ok(value) = topic.try_recv() {
        assert_eq!(value["manager_id"], manager_id.to_string());
        originators.push(value["originator"].as_str().unwrap_or_default().to_string());
    }
    assert!(originators.iter().any(|o| o == "step"));
    assert!(originators.iter().any(|o| o == "manager"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn job_logs_of_unknown_job_fail() {
    let engine = engine();
    let err = engine
        .job_logs(jobflow::JobId::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, JobflowError::Store(_)));
}
