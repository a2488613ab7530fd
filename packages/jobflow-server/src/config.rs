use anyhow::{Context, Result};
use dotenvy::dotenv;
use jobflow::EngineConfig;
use std::env;
use std::time::Duration;

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// How long shutdown waits for workers to return
    pub shutdown_grace: Duration,
    pub engine: EngineConfig,
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            shutdown_grace: Duration::from_secs(
                env::var("SHUTDOWN_GRACE_SECS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .context("SHUTDOWN_GRACE_SECS must be a valid number")?,
            ),
            engine: EngineConfig::from_env().context("Failed to load engine configuration")?,
        })
    }
}
