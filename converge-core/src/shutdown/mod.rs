//! Graceful shutdown coordinator
//!
//! Workers subscribe to the coordinator and check it once per loop
//! iteration, finishing and acknowledging their in-flight event before
//! exiting. The engine marks the coordinator complete only after every
//! task has joined and buffered work has been flushed.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{error, info, warn};

/// Shutdown signal
#[derive(Debug, Clone, Copy)]
pub enum ShutdownSignal {
    Graceful,
    Immediate,
}

/// Shutdown state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    ShuttingDown,
    Shutdown,
}

/// Graceful shutdown coordinator
pub struct ShutdownCoordinator {
    state: Arc<RwLock<ShutdownState>>,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);

        Self {
            state: Arc::new(RwLock::new(ShutdownState::Running)),
            shutdown_tx,
            timeout,
        }
    }

    /// Subscribe to shutdown notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.shutdown_tx.subscribe()
    }

    /// Deadline components get to drain before being abandoned
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Signal a graceful shutdown. Returns immediately; the caller
    /// drains its tasks and then calls `mark_complete`.
    pub async fn begin_shutdown(&self) {
        let mut state = self.state.write().await;
        if *state != ShutdownState::Running {
            warn!("Shutdown already in progress");
            return;
        }
        *state = ShutdownState::ShuttingDown;
        drop(state);

        info!("Initiating graceful shutdown");
        // Send fails only when nothing subscribed yet, which is fine.
        if self.shutdown_tx.send(ShutdownSignal::Graceful).is_err() {
            warn!("No components subscribed to shutdown signal");
        }
    }

    /// Signal an immediate shutdown; in-flight work may be abandoned.
    pub async fn shutdown_immediately(&self) {
        warn!("Initiating immediate shutdown");

        let mut state = self.state.write().await;
        *state = ShutdownState::Shutdown;
        drop(state);

        if let Err(e) = self.shutdown_tx.send(ShutdownSignal::Immediate) {
            error!("Failed to send immediate shutdown signal: {}", e);
        }
    }

    /// Record that every component has drained.
    pub async fn mark_complete(&self) {
        let mut state = self.state.write().await;
        *state = ShutdownState::Shutdown;
        info!("Shutdown complete");
    }

    /// Check if shutdown is in progress
    pub async fn is_shutting_down(&self) -> bool {
        let state = self.state.read().await;
        *state == ShutdownState::ShuttingDown || *state == ShutdownState::Shutdown
    }

    /// Get current state
    pub async fn state(&self) -> ShutdownState {
        *self.state.read().await
    }

    /// Wait for a shutdown signal
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.subscribe();
        let _ = rx.recv().await;
    }
}

/// Install signal handlers for graceful shutdown
#[cfg(unix)]
pub fn install_signal_handlers(coordinator: Arc<ShutdownCoordinator>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to install SIGINT handler: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
                coordinator.begin_shutdown().await;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
                coordinator.begin_shutdown().await;
            }
        }
    });
}

/// Install signal handlers for graceful shutdown (Windows)
#[cfg(windows)]
pub fn install_signal_handlers(coordinator: Arc<ShutdownCoordinator>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C");
            coordinator.begin_shutdown().await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_state_machine() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        assert_eq!(coordinator.state().await, ShutdownState::Running);

        coordinator.begin_shutdown().await;
        assert_eq!(coordinator.state().await, ShutdownState::ShuttingDown);
        assert!(coordinator.is_shutting_down().await);

        coordinator.mark_complete().await;
        assert_eq!(coordinator.state().await, ShutdownState::Shutdown);
    }

    #[tokio::test]
    async fn test_subscribers_receive_signal() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let mut rx = coordinator.subscribe();

        coordinator.begin_shutdown().await;
        let signal = rx.recv().await.unwrap();
        assert!(matches!(signal, ShutdownSignal::Graceful));
    }

    #[tokio::test]
    async fn test_double_shutdown_is_harmless() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        coordinator.begin_shutdown().await;
        coordinator.begin_shutdown().await;
        assert!(coordinator.is_shutting_down().await);
    }
}
