//! Shutdown signals as a [`CancellationToken`].
//!
//! SIGINT and SIGTERM cancel the token once; anything holding a clone (retry loops,
//! event subscriptions) winds down on its own.

use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

pub struct SigDown {
    cancel: CancellationToken,
}

impl SigDown {
    /// Install the handlers. Fails only if the runtime cannot register them.
    pub fn try_new() -> std::io::Result<Self> {
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let cancel = CancellationToken::new();
        let inner = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = interrupt.recv() => tracing::info!("SIGINT received, cancelling in-flight work"),
                _ = terminate.recv() => tracing::info!("SIGTERM received, cancelling in-flight work"),
                _ = inner.cancelled() => return,
            }
            inner.cancel();
        });
        Ok(Self { cancel })
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
