use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a handler that cancels the returned token on SIGTERM or SIGINT.
///
/// The coordinator checks the token between phases and the monitor checks it
/// between poll rounds, so a round already in flight finishes first.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::warn!("Received SIGTERM, cancelling ingestion");
            }
            _ = sigint.recv() => {
                tracing::warn!("Received SIGINT, cancelling ingestion");
            }
        }

        token_clone.cancel();
    });

    Ok(token)
}
