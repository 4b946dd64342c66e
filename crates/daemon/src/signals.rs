//! Signal handling for the daemon.
//!
//! SIGTERM and SIGINT (Ctrl+C everywhere) end the daemon. On Unix, SIGUSR1
//! requests an immediate sync cycle.

use tokio::sync::mpsc;
use tracing::{error, info};

/// Wait for a shutdown signal (SIGTERM, SIGINT, or Ctrl+C).
pub async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("received SIGTERM");
        }
    }
}

/// Forward every SIGUSR1 to the scheduler as an immediate sync request.
#[cfg(unix)]
pub async fn forward_sync_requests(tx: mpsc::Sender<()>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigusr1 = match signal(SignalKind::user_defined1()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGUSR1 handler, manual sync trigger disabled");
            return;
        }
    };
    while sigusr1.recv().await.is_some() {
        info!("received SIGUSR1, requesting immediate sync");
        if tx.send(()).await.is_err() {
            break;
        }
    }
}

#[cfg(not(unix))]
pub async fn forward_sync_requests(_tx: mpsc::Sender<()>) {}
