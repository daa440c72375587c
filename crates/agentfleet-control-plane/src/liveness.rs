//! Periodic heartbeat sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::controller::Controller;

/// Mark nodes with stale heartbeats `not-ready` every `interval` until
/// `shutdown` fires.
pub async fn run_liveness_sweep(controller: Arc<Controller>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately; nothing can be stale yet.
    ticker.tick().await;

    info!(interval_secs = interval.as_secs(), "Liveness sweep started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let marked = controller.sweep_stale(Utc::now()).await;
                debug!(
                    sessions = controller.connected_count(),
                    marked = marked.len(),
                    "Liveness sweep"
                );
            }
            _ = shutdown.cancelled() => {
                info!("Liveness sweep stopped");
                return;
            }
        }
    }
}
