pub mod http;

use crate::config::Config;
use crate::media::MediaService;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

pub async fn run(config: Arc<Config>, service: Arc<MediaService>, listen: SocketAddr) -> Result<()> {
    let delivery = service.delivery();
    let app = http::router(
        http::AppState {
            service,
            max_credential_bytes: config.server.max_credential_bytes,
        },
        config.server.cors,
    );

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    info!("Relay listening on http://{} ({:?} delivery)", listen, delivery);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Relay server failed")?;

    info!("Relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to install Ctrl+C handler: {}", e);
        // Keep serving rather than shutting down straight away
        std::future::pending::<()>().await;
    }
}
