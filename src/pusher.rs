//! Pusher - periodic publishing of recorded versions
//!
//! Recording a version is local and fast; pushing is networked and slow.
//! The pusher publishes on a fixed interval regardless of write activity.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::store::VersionedStore;

/// Fixed-interval publisher
pub struct Pusher {
    interval: Duration,
    store: Arc<dyn VersionedStore>,
}

impl Pusher {
    /// A zero interval disables periodic publishing
    pub fn new(interval: Duration, store: Arc<dyn VersionedStore>) -> Self {
        Self { interval, store }
    }

    pub fn is_enabled(&self) -> bool {
        !self.interval.is_zero()
    }

    /// Publish once per tick until `shutdown` fires (or its sender is dropped).
    ///
    /// Returns immediately when disabled. Publish failures are logged and
    /// retried on the next tick.
    pub async fn start(self, mut shutdown: broadcast::Receiver<()>) {
        if !self.is_enabled() {
            info!("Periodic push disabled");
            return;
        }

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Pusher started with interval: {:?}", self.interval);

        // Skip the first immediate tick
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutdown signal received in pusher");
                    break;
                }

                _ = ticker.tick() => {
                    debug!("Starting scheduled publish");
                    let started = Instant::now();

                    match self.store.publish().await {
                        Ok(()) => debug!("Publish finished in {:.2}s", started.elapsed().as_secs_f64()),
                        Err(e) => error!("Error while pushing: {:#}", e),
                    }
                }
            }
        }

        info!("Pusher stopped");
    }
}
