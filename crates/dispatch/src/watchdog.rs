//! Background recovery of lost units.
//!
//! Sweeps every `sweep_interval`: units past their deadline are reclaimed
//! and re-offered to idle workers, and sessions that settled longer than the
//! retention period ago are dropped from the registry.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::coordinator::DispatchCoordinator;

/// A single long-lived Tokio task driving [`DispatchCoordinator::sweep`].
pub struct LostUnitWatchdog {
    coordinator: Arc<DispatchCoordinator>,
    sweep_interval: Duration,
}

impl LostUnitWatchdog {
    /// Create a watchdog using the coordinator's configured interval.
    pub fn new(coordinator: Arc<DispatchCoordinator>) -> Self {
        let sweep_interval = coordinator.config().sweep_interval;
        Self {
            coordinator,
            sweep_interval,
        }
    }

    /// Run the sweep loop until the cancellation token is triggered.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            sweep_interval_ms = self.sweep_interval.as_millis() as u64,
            "Lost-unit watchdog started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Lost-unit watchdog shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let summary = self.coordinator.sweep().await;
                    if summary.reclaimed > 0 || summary.retired > 0 {
                        tracing::debug!(
                            reclaimed = summary.reclaimed,
                            retired = summary.retired,
                            "Watchdog sweep",
                        );
                    }
                }
            }
        }
    }
}
