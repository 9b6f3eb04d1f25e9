//! HTTP server lifecycle

use anyhow::Context;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use whipcast_api::{create_router, AppState};
use whipcast_core::Config;
use whipcast_sfu::StreamManager;

/// Serve the API until a shutdown signal arrives or `shutdown` is cancelled
pub async fn serve_http(
    config: &Config,
    manager: Arc<StreamManager>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let http_address = config.http_address();
    let router = create_router(AppState::new(manager, config.server.max_ws_message_bytes));

    let listener = tokio::net::TcpListener::bind(&http_address)
        .await
        .with_context(|| format!("Failed to bind HTTP address {http_address}"))?;
    info!("HTTP server listening on {}", http_address);

    let graceful = async move {
        tokio::select! {
            () = shutdown_signal() => {}
            () = shutdown.cancelled() => {
                error!("Media worker failure requested shutdown");
            }
        }
    };

    axum::serve(listener, router)
        .with_graceful_shutdown(graceful)
        .await
        .context("HTTP server error")?;

    info!("HTTP server shut down gracefully");
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
