//! Heartbeat loop.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ClientError;

/// Call `beat` every `interval` until `stopped` fires. A failed beat stops
/// the client by cancelling `stopped`.
pub async fn run_heartbeat_loop<F, Fut>(interval: Duration, stopped: CancellationToken, mut beat: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), ClientError>>,
{
    let mut timer = tokio::time::interval(interval);
    // Registration just refreshed the node; skip the immediate tick.
    timer.tick().await;

    loop {
        tokio::select! {
            _ = timer.tick() => {}
            _ = stopped.cancelled() => return,
        }

        match beat().await {
            Ok(()) => debug!("Heartbeat acknowledged"),
            Err(e) => {
                warn!(error = %e, "Heartbeat failed, stopping client");
                stopped.cancel();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_failed_beat_stops_client() {
        let beats = Arc::new(AtomicU32::new(0));
        let stopped = CancellationToken::new();

        let counter = beats.clone();
        run_heartbeat_loop(Duration::from_secs(10), stopped.clone(), move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Ok(())
                } else {
                    Err(ClientError::Closed)
                }
            }
        })
        .await;

        assert_eq!(beats.load(Ordering::SeqCst), 3);
        assert!(stopped.is_cancelled());
    }
}
