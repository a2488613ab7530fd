//! Demo worker and step type wired into the server.
//!
//! `fan_out` steps spawn one `echo` job per entry of `config.items`; each echo
//! job logs its item and counts it as one document.

use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use jobflow::{FanOutStepManager, Job, LogLevel, Worker, WorkerContext};
use serde_json::Value;

pub const ECHO_JOB_TYPE: &str = "echo";
pub const FAN_OUT_STEP_TYPE: &str = "fan_out";

pub fn fan_out_step_manager() -> FanOutStepManager {
    FanOutStepManager::new(FAN_OUT_STEP_TYPE, ECHO_JOB_TYPE)
}

pub struct EchoWorker;

#[async_trait]
impl Worker for EchoWorker {
    fn job_type(&self) -> &str {
        ECHO_JOB_TYPE
    }

    fn validate(&self, payload: &Value) -> anyhow::Result<()> {
        match payload {
            Value::Object(_) | Value::Null => Ok(()),
            other => bail!("payload must be an object, got {other}"),
        }
    }

    async fn execute(&self, ctx: &WorkerContext, job: &Job) -> anyhow::Result<()> {
        let item = job.payload.get("item").unwrap_or(&job.payload);

        // Optional artificial latency, e.g. {"delay_ms": 500}
        if let Some(ms) = item.get("delay_ms").and_then(Value::as_u64) {
            tokio::select! {
                _ = ctx.cancellation().cancelled() => bail!("cancelled"),
                _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
            }
        }
        if item.get("fail").and_then(Value::as_bool).unwrap_or(false) {
            bail!("echo asked to fail");
        }

        ctx.log(LogLevel::Info, format!("echo: {item}")).await?;
        ctx.add_documents(1).await?;
        ctx.add_results(1).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobflow::{Engine, EngineConfig, FailureAction, JobDefinition, JobStatus, StepDefinition};
    use serde_json::json;

    #[test]
    fn test_rejects_non_object_payload() {
        assert!(EchoWorker.validate(&json!({"item": 1})).is_ok());
        assert!(EchoWorker.validate(&json!("text")).is_err());
    }

    #[tokio::test]
    async fn test_fan_out_pipeline_counts_documents() {
        let engine = Engine::builder()
            .with_config(EngineConfig::fast())
            .with_worker(EchoWorker)
            .with_step_manager(fan_out_step_manager())
            .build()
            .unwrap();
        engine.start();

        let definition = JobDefinition::new("echoes").step(
            StepDefinition::new("say", FAN_OUT_STEP_TYPE)
                .with_config("items", json!(["a", "b", { "fail": true }]))
                .tolerate_child_failures(2, FailureAction::StopAll),
        );
        let manager = engine.run(&definition).await.unwrap();

        assert_eq!(manager.status, JobStatus::Completed);
        assert_eq!(manager.document_count, 2);
        assert_eq!(manager.metadata.step_stats[0].failed_count, 1);

        engine.shutdown(std::time::Duration::from_secs(5)).await;
    }
}
