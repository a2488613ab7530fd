//! Engine configuration.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

/// Tunables for the dispatcher and the monitors.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of dispatcher loops pulling from the shared queue
    pub concurrency: usize,
    /// Shortest wait for queued work when the queue is idle
    pub min_poll_interval: Duration,
    /// Longest wait for queued work when the queue is idle
    pub max_poll_interval: Duration,
    /// How often running workers heartbeat
    pub heartbeat_interval: Duration,
    /// Step monitor tick
    pub step_poll_interval: Duration,
    /// How long a child-returning step may sit at zero children
    pub zero_children_grace: Duration,
    /// Upper bound on waiting for a step's children
    pub step_timeout: Duration,
    /// Running jobs silent for longer than this are stale
    pub stale_threshold: Duration,
    /// Stale-job scan period
    pub stale_scan_interval: Duration,
    /// Minimum spacing between job progress events
    pub progress_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            min_poll_interval: Duration::from_millis(50),
            max_poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(30),
            step_poll_interval: Duration::from_secs(5),
            zero_children_grace: Duration::from_secs(30),
            step_timeout: Duration::from_secs(30 * 60),
            stale_threshold: Duration::from_secs(10 * 60),
            stale_scan_interval: Duration::from_secs(60),
            progress_interval: Duration::from_secs(2),
        }
    }
}

impl EngineConfig {
    /// Load configuration from `JOBFLOW_*` environment variables, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let defaults = Self::default();
        Ok(Self {
            concurrency: parse_var("JOBFLOW_CONCURRENCY")?.unwrap_or(defaults.concurrency),
            min_poll_interval: millis("JOBFLOW_MIN_POLL_MS")?
                .unwrap_or(defaults.min_poll_interval),
            max_poll_interval: millis("JOBFLOW_MAX_POLL_MS")?
                .unwrap_or(defaults.max_poll_interval),
            heartbeat_interval: secs("JOBFLOW_HEARTBEAT_SECS")?
                .unwrap_or(defaults.heartbeat_interval),
            step_poll_interval: millis("JOBFLOW_STEP_POLL_MS")?
                .unwrap_or(defaults.step_poll_interval),
            zero_children_grace: secs("JOBFLOW_ZERO_CHILDREN_GRACE_SECS")?
                .unwrap_or(defaults.zero_children_grace),
            step_timeout: secs("JOBFLOW_STEP_TIMEOUT_SECS")?.unwrap_or(defaults.step_timeout),
            stale_threshold: secs("JOBFLOW_STALE_THRESHOLD_SECS")?
                .unwrap_or(defaults.stale_threshold),
            stale_scan_interval: secs("JOBFLOW_STALE_SCAN_SECS")?
                .unwrap_or(defaults.stale_scan_interval),
            progress_interval: millis("JOBFLOW_PROGRESS_MS")?
                .unwrap_or(defaults.progress_interval),
        }
        .normalized())
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self.normalized()
    }

    pub fn with_step_poll_interval(mut self, interval: Duration) -> Self {
        self.step_poll_interval = interval;
        self
    }

    pub fn with_zero_children_grace(mut self, grace: Duration) -> Self {
        self.zero_children_grace = grace;
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    pub fn with_stale_scan_interval(mut self, interval: Duration) -> Self {
        self.stale_scan_interval = interval;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Settings suited to tests: millisecond ticks and a short grace window.
    pub fn fast() -> Self {
        Self {
            concurrency: 4,
            min_poll_interval: Duration::from_millis(5),
            max_poll_interval: Duration::from_millis(50),
            heartbeat_interval: Duration::from_millis(100),
            step_poll_interval: Duration::from_millis(20),
            zero_children_grace: Duration::from_millis(200),
            step_timeout: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(60),
            stale_scan_interval: Duration::from_secs(60),
            progress_interval: Duration::from_millis(50),
        }
    }

    pub(crate) fn normalized(mut self) -> Self {
        self.concurrency = self.concurrency.max(1);
        if self.max_poll_interval < self.min_poll_interval {
            self.max_poll_interval = self.min_poll_interval;
        }
        self
    }
}

fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{name} must be a valid number")),
        Err(_) => Ok(None),
    }
}

fn millis(name: &str) -> Result<Option<Duration>> {
    Ok(parse_var::<u64>(name)?.map(Duration::from_millis))
}

fn secs(name: &str) -> Result<Option<Duration>> {
    Ok(parse_var::<u64>(name)?.map(Duration::from_secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.zero_children_grace, Duration::from_secs(30));
        assert_eq!(config.step_timeout, Duration::from_secs(1800));
    }

    #[test]
    fn test_concurrency_never_zero() {
        let config = EngineConfig::default().with_concurrency(0);
        assert_eq!(config.concurrency, 1);
    }

    #[test]
    fn test_from_env_overrides() {
        // Variable names unique to this test so parallel tests don't interfere.
        env::set_var("JOBFLOW_STEP_TIMEOUT_SECS", "90");
        let config = EngineConfig::from_env().unwrap();
        env::remove_var("JOBFLOW_STEP_TIMEOUT_SECS");

        assert_eq!(config.step_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_invalid_number_is_an_error() {
        assert!(parse_var::<u64>("JOBFLOW_TEST_PARSE_GARBAGE").unwrap().is_none());
        env::set_var("JOBFLOW_TEST_PARSE_GARBAGE", "soon");
        let err = parse_var::<u64>("JOBFLOW_TEST_PARSE_GARBAGE").unwrap_err();
        env::remove_var("JOBFLOW_TEST_PARSE_GARBAGE");

        assert!(err.to_string().contains("JOBFLOW_TEST_PARSE_GARBAGE"));
    }
}
