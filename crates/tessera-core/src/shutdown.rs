//! Graceful shutdown coordination.
//!
//! A [`GracefulShutdown`] fans one shutdown decision out to any number of
//! [`ShutdownToken`]s. Receiver loops poll or await their token between
//! blocking slices; the binary waits on process signals.

use std::future::Future;

use tokio::sync::{broadcast, watch};

/// What triggered the shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGINT (Ctrl+C).
    Interrupt,
    /// SIGTERM.
    Terminate,
    /// An in-process request.
    Requested,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Interrupt => write!(f, "SIGINT"),
            ShutdownSignal::Terminate => write!(f, "SIGTERM"),
            ShutdownSignal::Requested => write!(f, "requested"),
        }
    }
}

/// A handle observing one shutdown decision.
#[derive(Clone)]
pub struct ShutdownToken {
    receiver: watch::Receiver<bool>,
}

impl ShutdownToken {
    /// Whether shutdown has been decided.
    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Wait until shutdown is decided.
    pub async fn cancelled(&mut self) {
        let _ = self.receiver.wait_for(|decided| *decided).await;
    }
}

/// Coordinates one shutdown decision per process.
pub struct GracefulShutdown {
    decision_tx: watch::Sender<bool>,
    signal_tx: broadcast::Sender<ShutdownSignal>,
}

impl GracefulShutdown {
    /// Create an undecided shutdown coordinator.
    pub fn new() -> Self {
        Self {
            decision_tx: watch::channel(false).0,
            signal_tx: broadcast::channel(1).0,
        }
    }

    /// A token observing the decision.
    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            receiver: self.decision_tx.subscribe(),
        }
    }

    /// Subscribe to the triggering signal.
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.signal_tx.subscribe()
    }

    /// Decide shutdown from inside the process.
    pub fn trigger(&self) {
        let _ = self.decision_tx.send(true);
        let _ = self.signal_tx.send(ShutdownSignal::Requested);
    }

    /// Wait for SIGINT or SIGTERM, then decide shutdown and return the
    /// signal that arrived.
    pub async fn wait(&self) -> ShutdownSignal {
        let signal = wait_for_signal().await;
        let _ = self.decision_tx.send(true);
        let _ = self.signal_tx.send(signal);
        signal
    }

    /// Run a future until it completes or shutdown is decided; `None` means
    /// shutdown won.
    pub async fn run_until_shutdown<F, T>(&self, future: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        let mut token = self.token();
        tokio::select! {
            result = future => Some(result),
            _ = token.cancelled() => None,
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

async fn wait_for_signal() -> ShutdownSignal {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let sigint = signal(SignalKind::interrupt());
        let sigterm = signal(SignalKind::terminate());
        match (sigint, sigterm) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => ShutdownSignal::Interrupt,
                    _ = sigterm.recv() => ShutdownSignal::Terminate,
                }
            }
            _ => {
                // Signal registration only fails in exotic environments;
                // fall back to Ctrl+C handling.
                let _ = tokio::signal::ctrl_c().await;
                ShutdownSignal::Interrupt
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        ShutdownSignal::Interrupt
    }
}
