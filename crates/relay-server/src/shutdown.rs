//! Graceful shutdown handling for the relay.
//!
//! A [`ShutdownCoordinator`] is triggered by an OS signal (or
//! programmatically), stops the listener from accepting new connections and
//! gives in-flight requests, including open SSE streams, a bounded time to
//! finish before the process exits.

use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

/// Shutdown phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    /// Normal operation
    Running,
    /// Listener closed, waiting for in-flight requests
    Draining,
    /// Drain deadline passed or all requests finished
    Complete,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Draining => write!(f, "draining"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

/// Broadcasts shutdown to the server and background tasks
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    phase: Arc<watch::Sender<ShutdownPhase>>,
    grace: Duration,
}

impl ShutdownCoordinator {
    /// Coordinator allowing `grace` for in-flight requests
    #[must_use]
    pub fn new(grace: Duration) -> Self {
        let (phase, _) = watch::channel(ShutdownPhase::Running);
        Self {
            phase: Arc::new(phase),
            grace,
        }
    }

    /// Time allowed for in-flight requests
    #[must_use]
    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> ShutdownPhase {
        *self.phase.borrow()
    }

    /// Whether shutdown has begun
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.phase() != ShutdownPhase::Running
    }

    /// Begin draining; later calls are no-ops
    pub fn trigger(&self, reason: &str) {
        let started = self.phase.send_if_modified(|phase| {
            if *phase == ShutdownPhase::Running {
                *phase = ShutdownPhase::Draining;
                true
            } else {
                false
            }
        });
        if started {
            info!(reason, grace_secs = self.grace.as_secs(), "Shutdown initiated");
        }
    }

    /// Mark shutdown as finished
    pub fn complete(&self) {
        self.phase.send_replace(ShutdownPhase::Complete);
    }

    /// Resolves once shutdown has been triggered
    pub async fn triggered(&self) {
        let mut rx = self.phase.subscribe();
        // The sender lives in `self`, so `wait_for` only fails if it is dropped.
        let _ = rx.wait_for(|phase| *phase != ShutdownPhase::Running).await;
    }

    /// Trigger on the first OS shutdown signal
    pub fn listen_for_signals(&self) -> tokio::task::JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let signal = shutdown_signal().await;
            coordinator.trigger(&signal);
        })
    }
}

/// Wait for SIGINT or SIGTERM and return its name
pub async fn shutdown_signal() -> String {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let name = tokio::select! {
        () = ctrl_c => "SIGINT",
        () = terminate => "SIGTERM",
    };
    info!(signal = name, "Received shutdown signal");
    name.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_moves_to_draining_once() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        assert_eq!(coordinator.phase(), ShutdownPhase::Running);
        assert!(!coordinator.is_shutting_down());

        coordinator.trigger("test");
        coordinator.trigger("again");
        assert_eq!(coordinator.phase(), ShutdownPhase::Draining);

        coordinator.complete();
        assert_eq!(coordinator.phase(), ShutdownPhase::Complete);
        assert_eq!(coordinator.phase().to_string(), "complete");
    }

    #[tokio::test]
    async fn test_triggered_resolves_after_trigger() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.triggered().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        coordinator.trigger("test");
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
