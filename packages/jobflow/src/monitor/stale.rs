use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::job::{Job, JobFilter, JobId, JobStatus};
use crate::log::LogLevel;
use crate::status::JobStatusManager;

/// Fails `running` jobs whose heartbeat went silent.
///
/// The scan runs in two passes: candidates are fetched by status only, then
/// heartbeat age is judged in memory, where a job that never heartbeated is
/// measured from `started_at` instead.
#[derive(Debug, Clone)]
pub struct StaleJobDetector {
    status: JobStatusManager,
    threshold: Duration,
    scan_interval: Duration,
    dispatcher: Option<Dispatcher>,
}

impl StaleJobDetector {
    pub fn new(status: JobStatusManager, config: &EngineConfig) -> Self {
        Self {
            status,
            threshold: config.stale_threshold,
            scan_interval: config.stale_scan_interval,
            dispatcher: None,
        }
    }

    /// Also signal cancellation to stale jobs still executing in this process.
    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Last sign of life: heartbeat, else start, else creation.
    fn last_seen(job: &Job) -> DateTime<Utc> {
        job.last_heartbeat
            .or(job.started_at)
            .unwrap_or(job.created_at)
    }

    pub fn is_stale(&self, job: &Job, now: DateTime<Utc>) -> bool {
        if job.status != JobStatus::Running {
            return false;
        }
        let millis = i64::try_from(self.threshold.as_millis()).unwrap_or(i64::MAX);
        let threshold = chrono::Duration::milliseconds(millis);
        now.signed_duration_since(Self::last_seen(job)) > threshold
    }

    /// One scan. Returns the ids that were marked failed.
    pub async fn scan_once(&self) -> Result<Vec<JobId>> {
        let candidates = self
            .status
            .list_jobs(&JobFilter::default().with_statuses([JobStatus::Running]))
            .await?;

        let now = Utc::now();
        let mut failed = Vec::new();
        for job in candidates.iter().filter(|job| self.is_stale(job, now)) {
            let message = match job.last_heartbeat {
                Some(at) => format!("stale: no heartbeat since {}", at.to_rfc3339()),
                None => format!(
                    "stale: no heartbeat since start at {}",
                    Self::last_seen(job).to_rfc3339()
                ),
            };

            let applied = self
                .status
                .update_job_status(job.id, JobStatus::Failed, Some(message.clone()))
                .await?;
            if !applied {
                continue;
            }

            warn!(job_id = %job.id, job_type = %job.job_type, "{}", message);
            if let Err(e) = self
                .status
                .add_job_log(job.id, LogLevel::Warn, message)
                .await
            {
                debug!(job_id = %job.id, error = %e, "failed to log stale job");
            }
            if let Some(dispatcher) = &self.dispatcher {
                dispatcher.cancel(job.id);
            }
            failed.push(job.id);
        }

        if !failed.is_empty() {
            info!(count = failed.len(), "stale jobs marked failed");
        }
        Ok(failed)
    }

    /// Scans every `scan_interval` until `shutdown` fires.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.scan_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.scan_once().await {
                            error!(error = %e, "stale job scan failed");
                        }
                    }
                }
            }
            debug!("stale job detector stopped");
        })
    }
}
