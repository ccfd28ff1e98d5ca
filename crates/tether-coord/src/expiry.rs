//! Background lease-expiry loop.
//!
//! A recurring job that submits expiry work through the same serialized
//! pipeline as external requests. The ticker holds no authority of its
//! own: it merely observes the clock and asks the coordinator to revoke
//! what the clock already revoked.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::coordinator::Coordinator;

/// Handle to the running expiry scan loop.
#[derive(Debug)]
pub struct ExpiryTicker {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl ExpiryTicker {
    /// Spawns the scan loop at the coordinator's configured interval.
    #[must_use]
    pub fn spawn(coordinator: Arc<Coordinator>) -> Self {
        let interval = coordinator.config().expiry_scan_interval;
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            // A slow scan must not cause a burst of catch-up scans.
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        match coordinator.expire_due(Utc::now()).await {
                            Ok(0) => {}
                            Ok(expired) => {
                                tracing::info!(expired, "expiry scan revoked leases");
                            }
                            Err(error) => {
                                // Durability failures here are retried by
                                // the next tick; the matured leases stay
                                // indexed.
                                tracing::error!(%error, "expiry scan failed");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        Self { handle, shutdown }
    }

    /// Stops the loop and waits for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}
