// ABOUTME: Process-wide shutdown signalling
// ABOUTME: Watch-based coordinator observed by the server and every client session

use std::sync::Arc;

use tokio::sync::watch;

/// Shutdown coordinator shared by the HTTP server and all sessions.
///
/// Backed by a `watch` channel so that listeners created after the signal
/// still observe it.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Initiate shutdown. Idempotent.
    pub fn trigger(&self) {
        if !self.tx.send_replace(true) {
            tracing::info!("Initiating graceful shutdown");
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been triggered.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        // Err means every sender is gone, which cannot happen while `self` holds one.
        let _ = rx.wait_for(|triggered| *triggered).await;
    }

    /// Trigger on Ctrl+C.
    pub fn listen_for_ctrl_c(&self) {
        let shutdown = self.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("Received shutdown signal");
                    shutdown.trigger();
                }
                Err(e) => tracing::warn!("Failed to listen for Ctrl+C: {}", e),
            }
        });
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
