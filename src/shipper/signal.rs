use super::ShipperInner;
use std::sync::Weak;
use tokio::signal;
#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal as unix_signal};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shuts the shipper down on SIGINT or SIGTERM. Holds only a weak reference,
/// so the listener never keeps a dropped shipper alive.
pub(crate) fn spawn_shutdown_hook(shipper: Weak<ShipperInner>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if !wait_for_signal().await {
            return;
        }

        let Some(inner) = shipper.upgrade() else {
            return;
        };
        let summary = super::shutdown::shutdown(&inner).await;
        info!(
            sent = summary.sent,
            failed = summary.failed,
            spilled = summary.spilled,
            "Shutdown triggered by signal completed"
        );
    })
}

/// Returns `false` when no signal listener could be installed.
pub(crate) async fn wait_for_signal() -> bool {
    #[cfg(unix)]
    {
        let mut sigterm = match unix_signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                error!("Failed to create SIGTERM handler: {}", err);
                return false;
            }
        };

        tokio::select! {
            result = signal::ctrl_c() => match result {
                Ok(()) => {
                    info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                    true
                }
                Err(err) => {
                    error!("Failed to listen for SIGINT: {}", err);
                    false
                }
            },
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
                true
            }
        }
    }

    #[cfg(not(unix))]
    {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                true
            }
            Err(err) => {
                error!("Failed to listen for SIGINT: {}", err);
                false
            }
        }
    }
}
