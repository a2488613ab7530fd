// Main entry point for the jobflow server

use std::time::Duration;

use anyhow::{Context, Result};
use jobflow::Engine;
use jobflow_server::echo::{fan_out_step_manager, EchoWorker};
use jobflow_server::{build_router, AppState, ServerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,jobflow=debug,jobflow_server=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting jobflow server");

    // Load configuration
    let config = ServerConfig::from_env().context("Failed to load configuration")?;
    tracing::info!(
        concurrency = config.engine.concurrency,
        port = config.port,
        "Configuration loaded"
    );

    // Build and start the engine
    let engine = Engine::builder()
        .with_config(config.engine.clone())
        .with_worker(EchoWorker)
        .with_step_manager(fan_out_step_manager())
        .build()
        .context("Failed to build engine")?;
    engine.start();

    // Drop stream topics nobody listens to anymore
    let hub = engine.hub().clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            hub.cleanup().await;
        }
    });

    let app = build_router(AppState {
        engine: engine.clone(),
    });

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);
    tracing::info!("Health check: http://localhost:{}/health", config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("HTTP server stopped, draining engine");
    if !engine.shutdown(config.shutdown_grace).await {
        tracing::warn!("Some workers were still running at exit");
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
