//! Visage Server - WebSocket API for talking-head video generation

use std::sync::Arc;

use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod error;
mod protocol;
mod state;

use state::AppState;
use visage_core::{Orchestrator, OrchestratorConfig, WorkerBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "visage_server=debug,visage_core=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Visage Server");

    // Load configuration
    let config = OrchestratorConfig::from_env();
    info!("Workspace directory: {:?}", config.workspace_dir);
    info!("Results directory: {:?}", config.results_dir);

    // Create the orchestration engine
    let backend = Arc::new(WorkerBackend::new(&config));
    let orchestrator = Orchestrator::new(config, backend)?;
    orchestrator.start();
    let state = AppState::new(orchestrator);

    info!("Orchestrator initialized");

    // Build router
    let app = api::create_router(state.clone());

    // Start server
    let host = std::env::var("VISAGE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port = match std::env::var("VISAGE_PORT") {
        Ok(raw) => match raw.parse::<u16>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!("Invalid VISAGE_PORT='{}', falling back to 8000", raw);
                8000
            }
        },
        Err(_) => 8000,
    };
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);

    // Spawn server with graceful shutdown
    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());

    info!("Server ready. Press Ctrl+C to stop.");
    server.await?;

    Ok(())
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        },
    }
}
