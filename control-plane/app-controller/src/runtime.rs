use std::net::SocketAddr;

use kube::Client;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{config::ControllerConfig, controller::run_controller, web::run_http_server};

/// Compute the HTTP bind address based on config.
pub fn compute_http_addr(cfg: &ControllerConfig) -> SocketAddr {
    ([0, 0, 0, 0], cfg.http_port).into()
}

/// Spawn the Kubernetes controller loop.
pub fn spawn_controller(
    client: Client,
    cfg: ControllerConfig,
    shutdown: CancellationToken,
) -> JoinHandle<anyhow::Result<()>> {
    tokio::spawn(async move { run_controller(client, cfg, shutdown).await })
}

/// Spawn the health endpoint server.
pub fn spawn_http(
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> JoinHandle<anyhow::Result<()>> {
    tokio::spawn(async move { run_http_server(addr, shutdown).await })
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Start the controller and the HTTP server; a shutdown signal stops both.
pub async fn run_all(client: Client, cfg: ControllerConfig) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let http_addr = compute_http_addr(&cfg);

    let controller = spawn_controller(client, cfg, shutdown.clone());
    let http = spawn_http(http_addr, shutdown.clone());

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_token.cancel();
    });

    let (c_res, h_res) = tokio::try_join!(controller, http)?;
    c_res?;
    h_res?;
    Ok(())
}
