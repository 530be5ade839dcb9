use std::future::Future;
use std::net::SocketAddr;

use kube::Client;
use tokio::{task::JoinHandle, try_join};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::OperatorConfig, controller::run_controller, web::run_http_server,
};

/// Compute the HTTP bind address based on config.
pub fn compute_http_addr(cfg: &OperatorConfig) -> SocketAddr {
    ([0, 0, 0, 0], cfg.http_port).into()
}

/// Spawn the Instance controller. The shutdown token is also cancelled when
/// the controller exits, which stops the HTTP server.
pub fn spawn_controller(
    client: Client,
    cfg: OperatorConfig,
    shutdown: CancellationToken,
) -> JoinHandle<anyhow::Result<()>> {
    tokio::spawn(async move {
        let _stop_http = shutdown.clone().drop_guard();
        run_controller(client, cfg, shutdown).await
    })
}

pub fn spawn_http(
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> JoinHandle<anyhow::Result<()>> {
    tokio::spawn(async move { run_http_server(addr, shutdown).await })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(
            tokio::signal::unix::SignalKind::terminate(),
        ) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
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

/// Cancel `shutdown` once `signal` resolves.
pub async fn cancel_on<F: Future<Output = ()>>(
    signal: F,
    shutdown: CancellationToken,
) {
    tokio::select! {
        _ = signal => {
            info!("shutdown signal received");
            shutdown.cancel();
        }
        _ = shutdown.cancelled() => {}
    }
}

/// Cancel `shutdown` on Ctrl+C or SIGTERM.
pub fn spawn_signal_listener(shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(cancel_on(shutdown_signal(), shutdown))
}

/// Start the controller and health server and wait until both finish.
pub async fn run_all(client: Client, cfg: OperatorConfig) -> anyhow::Result<()> {
    let http_addr = compute_http_addr(&cfg);
    let shutdown = CancellationToken::new();

    spawn_signal_listener(shutdown.clone());
    let controller = spawn_controller(client, cfg, shutdown.clone());
    let http = spawn_http(http_addr, shutdown);

    let (c_res, h_res) = try_join!(controller, http)?;
    c_res?;
    h_res?;
    Ok(())
}
