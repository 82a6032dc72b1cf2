//! OS termination signals.
//!
//! On Unix SIGINT, SIGTERM and SIGQUIT are handled, with
//! [`tokio::signal::ctrl_c`] as a fallback. Elsewhere only Ctrl-C is awaited.

use tokio_util::sync::CancellationToken;

use crate::Result;

#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigint.recv()  => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// Cancel `token` when a termination signal arrives. Returns quietly if the
/// token fires first.
pub async fn cancel_on_signal(token: CancellationToken) -> Result<()> {
    tokio::select! {
        _ = token.cancelled() => Ok(()),
        received = wait_for_shutdown_signal() => {
            received?;
            tracing::info!("termination signal received");
            token.cancel();
            Ok(())
        }
    }
}
