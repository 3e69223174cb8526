use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use renderfarm_api::background::group_retention;
use renderfarm_api::config::{LogFormat, ServerConfig};
use renderfarm_api::router::build_app_router;
use renderfarm_api::state::AppState;
use renderfarm_comfyui::{ComfyUIPatcher, ComfyUIRegistry};
use renderfarm_pipeline::JobGroupManager;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Configuration ---
    let config = ServerConfig::from_env().expect("Invalid server configuration");

    // --- Tracing ---
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "renderfarm_api=debug,renderfarm_pipeline=debug,renderfarm_comfyui=info,tower_http=debug"
            .into()
    });
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }

    tracing::info!(
        host = %config.host,
        port = %config.port,
        backends = config.comfyui_instances.len(),
        "Loaded server configuration"
    );
    if config.comfyui_instances.is_empty() {
        tracing::warn!("No ComfyUI instances configured; every submission will be rejected");
    }

    // --- Backends ---
    let registry = Arc::new(ComfyUIRegistry::new(
        config.comfyui_instances.clone(),
        config.probe_timeout(),
    ));
    let patcher = Arc::new(ComfyUIPatcher::default());

    // --- Scheduler ---
    let manager = Arc::new(JobGroupManager::new(
        registry,
        patcher,
        config.scheduler.clone(),
    ));
    tracing::info!("Job group manager started");

    let retention_cancel = CancellationToken::new();
    let retention_handle = tokio::spawn(group_retention::run(
        Arc::clone(&manager),
        config.sweep_interval(),
        retention_cancel.clone(),
    ));

    // --- App state ---
    let state = AppState {
        config: Arc::new(config.clone()),
        manager: Arc::clone(&manager),
    };
    let app = build_app_router(state, &config);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    let shutdown_timeout = Duration::from_secs(config.shutdown_timeout_secs);
    let drain_manager = Arc::clone(&manager);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Cancelling the groups completes their event streams, which
            // lets open WebSocket connections close before the drain.
            if tokio::time::timeout(shutdown_timeout, drain_manager.shutdown())
                .await
                .is_err()
            {
                tracing::warn!("Job group manager did not shut down in time");
            }
        })
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    retention_cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), retention_handle).await;
    tracing::info!("Group retention job stopped");

    tracing::info!(
        retained_groups = manager.group_count().await,
        "Graceful shutdown complete"
    );
}

/// Wait for SIGINT (Ctrl-C) or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
