//! Process shutdown on SIGINT / SIGTERM.

use tokio::signal;
use tokio::sync::watch;
use tracing::info;

/// Completes when the process receives SIGINT or SIGTERM.
pub async fn signal_received() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// A `watch` flag flipped to `true` once a shutdown signal arrives, for
/// loops that check it between units of work.
pub fn watch_signals() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        signal_received().await;
        let _ = tx.send(true);
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_watch_starts_unset() {
        let rx = watch_signals();
        assert!(!*rx.borrow());
    }
}
