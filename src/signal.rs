//! Turns termination signals into a cancellation of the pollers.
//!
//! On unix, SIGINT, SIGTERM and SIGQUIT are handled. Elsewhere only
//! Ctrl-C is.

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Waits for a termination signal.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

/// Waits for a termination signal.
#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// Cancel `token` when a termination signal arrives.
pub fn cancel_on_shutdown_signal(token: CancellationToken) {
    tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(()) => {
                info!("Received shutdown signal, stopping pollers...");
                token.cancel();
            }
            Err(e) => error!("Couldn't listen for shutdown signals: {:?}", e),
        }
    });
}
