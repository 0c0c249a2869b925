//! Process signals that stop the gateway.

use std::fmt;
use std::future::{Future, pending};

use tokio::signal;
use tracing::{error, warn};

/// Signal that asked the gateway to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupt => write!(f, "SIGINT"),
            Self::Terminate => write!(f, "SIGTERM"),
        }
    }
}

/// Resolve on Ctrl+C or SIGTERM.
///
/// `main` follows this with `AppState::begin_shutdown`, which ends open event
/// streams so the server can drain, then `AppState::shutdown` waits for the
/// background consumer. A listener that cannot be installed is logged and
/// never fires.
pub async fn shutdown_signal() -> ShutdownSignal {
    first_signal(interrupt(), terminate()).await
}

async fn interrupt() {
    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "Cannot listen for SIGINT");
        pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            error!(error = %e, "Cannot listen for SIGTERM");
            pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    pending::<()>().await;
}

async fn first_signal(
    interrupt: impl Future<Output = ()>,
    terminate: impl Future<Output = ()>,
) -> ShutdownSignal {
    let signal = tokio::select! {
        () = interrupt => ShutdownSignal::Interrupt,
        () = terminate => ShutdownSignal::Terminate,
    };
    warn!(%signal, "Shutdown requested, closing streams and the background consumer");
    signal
}
