//! Signal handling
//!
//! SIGINT and SIGTERM cancel the running workflow. The run stops at its next
//! await point; the live configuration is never left half written because
//! every write is an atomic rename.

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Signal that ended the run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalType {
    Interrupt,
    Terminate,
}

/// Wait for SIGINT or SIGTERM
#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<SignalType> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = interrupt.recv() => Ok(SignalType::Interrupt),
        _ = terminate.recv() => Ok(SignalType::Terminate),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<SignalType> {
    tokio::signal::ctrl_c().await?;
    Ok(SignalType::Interrupt)
}

/// Cancel `token` on the first shutdown signal.
///
/// Must be called from within a Tokio runtime.
pub fn cancel_on_signal(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            result = wait_for_signal() => match result {
                Ok(signal) => {
                    warn!(signal = ?signal, "Received shutdown signal, cancelling run");
                    token.cancel();
                }
                Err(e) => debug!(error = %e, "Signal handlers unavailable"),
            },
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handler_exits_when_token_cancelled() {
        let token = CancellationToken::new();
        let handle = cancel_on_signal(token.clone());
        token.cancel();
        handle.await.unwrap();
    }
}
