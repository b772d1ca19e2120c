//! Signal handling

use kiln_core::Result;
use tokio_util::sync::CancellationToken;

/// Cancel `token` when SIGTERM or SIGINT arrives.
///
/// The controller stops before its next frame and the heartbeat winds down
/// with it.
#[cfg(unix)]
pub fn install_shutdown_handler(token: CancellationToken) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, stopping worker");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, stopping worker");
            }
        }

        token.cancel();
    });

    Ok(())
}

#[cfg(not(unix))]
pub fn install_shutdown_handler(token: CancellationToken) -> Result<()> {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received Ctrl-C, stopping worker"),
            Err(e) => {
                tracing::warn!("Failed to listen for Ctrl-C: {}", e);
                return;
            }
        }
        token.cancel();
    });

    Ok(())
}
