//! Region host – drives a [`RegionService`] for the lifetime of the process.
//!
//! ## Lifecycle
//!
//! | Phase    | Effect                                                     |
//! |----------|------------------------------------------------------------|
//! | start    | child update timer started, `region/online` to neighbors   |
//! | run      | `RegionService::tick` at `tick_rate_hz`                    |
//! | shutdown | `region/offline` to neighbors, queued child updates flushed |

use crate::service::RegionService;
use log::{debug, error, info, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Tick rate in Hz.
    pub tick_rate_hz: f32,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self { tick_rate_hz: 20.0 }
    }
}

/// Call [`RegionHost::run`] inside a Tokio runtime to bring the region up.
pub struct RegionHost {
    config: HostConfig,
    service: Arc<RegionService>,
}

impl RegionHost {
    pub fn new(config: HostConfig, service: Arc<RegionService>) -> Self {
        Self { config, service }
    }

    pub fn service(&self) -> &Arc<RegionService> {
        &self.service
    }

    /// Announce the region and start background timers. Returns how many
    /// neighbors acknowledged.
    pub async fn start(&self) -> usize {
        self.service.neighbors().start();
        self.service.neighbors().announce_online().await
    }

    /// Announce shutdown to neighbors and flush queued child updates.
    pub async fn stop(&self) -> usize {
        let notified = self.service.neighbors().announce_offline().await;
        self.service.neighbors().shutdown();
        notified
    }

    /// Run until Ctrl-C.
    pub async fn run(self) {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {e}");
            }
        })
        .await
    }

    /// Run until `shutdown` resolves, then stop cleanly.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) {
        info!(
            "Region {} starting at ({}, {})",
            self.service.config().name,
            self.service.config().region_x,
            self.service.config().region_y
        );
        self.start().await;

        // -------------------------------------------------------------------
        // Tick loop
        // -------------------------------------------------------------------

        let service = self.service.clone();
        let period = Duration::from_secs_f32(1.0 / self.config.tick_rate_hz.max(0.1));
        info!("Region ticking at {:.0}Hz", self.config.tick_rate_hz);
        let tick_handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                timer.tick().await;
                let report = service.tick();
                if report.crossings_started > 0 || report.children_expired > 0 {
                    debug!(
                        "Tick {}: {} crossing(s) started, {} child presence(s) expired",
                        report.tick, report.crossings_started, report.children_expired
                    );
                }
            }
        });

        // -------------------------------------------------------------------
        // Wait for shutdown
        // -------------------------------------------------------------------

        let mut tick_handle = tick_handle;
        tokio::select! {
            _ = &mut tick_handle => {
                error!("Region tick loop exited unexpectedly");
            }
            _ = shutdown => {
                info!("Region {} shutting down", self.service.config().name);
            }
        }
        tick_handle.abort();

        self.stop().await;
    }
}
