//! Shutdown signal handling

use std::fmt;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Which signal ended the wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupt => f.write_str("SIGINT"),
            Self::Terminate => f.write_str("SIGTERM"),
        }
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        },
        Err(e) => {
            warn!("SIGTERM handler unavailable, Ctrl+C only: {}", e);
            std::future::pending::<()>().await;
        },
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

/// Wait for Ctrl+C, or SIGTERM on Unix
pub async fn wait_for_shutdown() -> ShutdownSignal {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => ShutdownSignal::Interrupt,
        _ = terminate() => ShutdownSignal::Terminate,
    }
}

/// Cancel `token` once a shutdown signal arrives
///
/// The listener also ends when the token is cancelled from elsewhere.
pub fn cancel_on_shutdown(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            signal = wait_for_shutdown() => {
                info!("{} received, shutting down", signal);
                token.cancel();
            },
            _ = token.cancelled() => {},
        }
    })
}

/// Await the listener task, logging it if it panicked or was aborted
///
/// Returns `true` when it ended normally.
pub async fn join_listener(listener: tokio::task::JoinHandle<()>) -> bool {
    match listener.await {
        Ok(()) => true,
        Err(e) => {
            warn!("Shutdown listener ended abnormally: {}", e);
            false
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listener_exits_when_token_cancelled() {
        let token = CancellationToken::new();
        let handle = cancel_on_shutdown(token.clone());
        token.cancel();
        assert!(handle.await.is_ok());
    }

    #[tokio::test]
    async fn test_join_listener_reports_abnormal_end() {
        let token = CancellationToken::new();
        let listener = cancel_on_shutdown(token.clone());
        token.cancel();
        assert!(join_listener(listener).await);

        let panicked = tokio::spawn(async { panic!("listener blew up") });
        assert!(!join_listener(panicked).await);

        let aborted = cancel_on_shutdown(CancellationToken::new());
        aborted.abort();
        assert!(!join_listener(aborted).await);
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(ShutdownSignal::Interrupt.to_string(), "SIGINT");
        assert_eq!(ShutdownSignal::Terminate.to_string(), "SIGTERM");
    }
}
