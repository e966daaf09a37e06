//! Graceful shutdown
//!
//! A [`ShutdownCoordinator`] fans one shutdown event out to every
//! background task (the refresh driver) over a broadcast channel, and
//! bounds how long the server waits for them.
//!
//! ```rust,ignore
//! let shutdown = ShutdownCoordinator::from_env();
//! let driver = coordinator.spawn(shutdown.subscribe());
//!
//! axum::serve(listener, app)
//!     .with_graceful_shutdown(shutdown.on_signal())
//!     .await?;
//! shutdown.drain(driver).await;
//! ```

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const DEFAULT_GRACE_PERIOD_SECS: u64 = 30;

#[derive(Clone)]
pub struct ShutdownCoordinator {
    tx: broadcast::Sender<()>,
    /// How long background tasks get to finish after the signal
    grace_period: Duration,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_GRACE_PERIOD_SECS))
    }
}

impl ShutdownCoordinator {
    pub fn new(grace_period: Duration) -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx, grace_period }
    }

    /// Reads `SHUTDOWN_GRACE_PERIOD_SECS`, falling back to `default`
    pub fn from_env_or(default: Duration) -> Self {
        let grace = std::env::var("SHUTDOWN_GRACE_PERIOD_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(default);
        Self::new(grace)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Notifies every subscriber
    pub fn shutdown(&self) {
        // No subscribers left is fine
        let _ = self.tx.send(());
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Waits for SIGINT/SIGTERM, then notifies subscribers
    ///
    /// Hand this to `with_graceful_shutdown` so the HTTP server and the
    /// background tasks stop on the same signal.
    pub async fn on_signal(self) {
        shutdown_signal().await;
        self.shutdown();
    }

    /// Waits up to the grace period for `task` to finish
    pub async fn drain(&self, task: JoinHandle<()>) {
        info!(
            grace_secs = self.grace_period.as_secs(),
            "Waiting for background tasks"
        );
        match tokio::time::timeout(self.grace_period, task).await {
            Ok(Ok(())) => info!("Background tasks stopped"),
            Ok(Err(e)) => warn!(error = %e, "Background task ended abnormally"),
            Err(_) => warn!(
                "Background tasks did not stop within {:?}",
                self.grace_period
            ),
        }
    }
}

/// Completes on SIGTERM or Ctrl+C
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
