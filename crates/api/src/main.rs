use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use renderhub_core::worker_registry::WorkerRegistry;
use renderhub_dispatch::{DispatchCoordinator, HttpWorkerClient, LostUnitWatchdog};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use renderhub_api::background;
use renderhub_api::config::ServerConfig;
use renderhub_api::router::build_app_router;
use renderhub_api::state::AppState;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "renderhub_api=debug,renderhub_dispatch=debug,tower_http=debug".into()
    });
    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    // --- Configuration ---
    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            std::process::exit(1);
        }
    };
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");
    if config.shared_secret.is_none() {
        tracing::warn!("SHARED_SECRET is not set; API routes are unauthenticated");
    }

    // --- Workers ---
    let workers = match WorkerRegistry::new(config.workers.clone()) {
        Ok(workers) => Arc::new(workers),
        Err(e) => {
            tracing::error!(error = %e, "Invalid worker table");
            std::process::exit(1);
        }
    };
    for endpoint in workers.endpoints() {
        tracing::info!(worker_id = %endpoint.id, url = %endpoint.url, "Registered worker");
    }

    // --- Artifact store ---
    let store = renderhub_storage::build_store(&config.storage).await;
    tracing::info!(backend = store.backend(), "Artifact store ready");

    // --- Coordinator ---
    let coordinator = DispatchCoordinator::new(
        config.coordinator.clone(),
        workers,
        Arc::new(HttpWorkerClient::new()),
        store,
    );

    // --- Background tasks ---
    let cancel = CancellationToken::new();
    let event_log_cancel = CancellationToken::new();

    let event_log_handle = tokio::spawn(background::event_log::run(
        coordinator.subscribe(),
        event_log_cancel.clone(),
    ));

    let watchdog = LostUnitWatchdog::new(Arc::clone(&coordinator));
    let watchdog_cancel = cancel.clone();
    let watchdog_handle = tokio::spawn(async move {
        watchdog.run(watchdog_cancel).await;
    });

    tracing::info!("Background services started (event log, lost-unit watchdog)");

    // --- App state ---
    let state = AppState {
        config: Arc::new(config.clone()),
        coordinator: Arc::clone(&coordinator),
    };
    let app = build_app_router(state, &config);

    // --- Start server ---
    let host: IpAddr = match config.host.parse() {
        Ok(host) => host,
        Err(e) => {
            tracing::error!(host = %config.host, error = %e, "Invalid HOST address");
            std::process::exit(1);
        }
    };
    let addr = SocketAddr::new(host, config.port);
    tracing::info!(%addr, "Starting server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(%addr, error = %e, "Failed to bind to address");
            std::process::exit(1);
        }
    };

    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    {
        tracing::error!(error = %e, "Server error");
    }

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    // Stop the watchdog first so no new re-dispatches start.
    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), watchdog_handle).await;
    tracing::info!("Lost-unit watchdog stopped");

    if tokio::time::timeout(Duration::from_secs(30), coordinator.shutdown())
        .await
        .is_err()
    {
        tracing::warn!("Timed out waiting for dispatch tasks");
    }

    // The event log outlives the coordinator's tasks so their events are logged.
    event_log_cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), event_log_handle).await;
    tracing::info!("Graceful shutdown complete");
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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
