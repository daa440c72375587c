//! Leader lease for coordination-capable stores.

use std::sync::Arc;
use std::time::Duration;

use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use agentfleet_store::{Store, StoreResult};

/// Claim leadership under `instance_id`. `None` if the store has no
/// coordination capability.
pub async fn claim_leadership(store: &dyn Store, instance_id: &str, ttl: Duration) -> StoreResult<Option<bool>> {
    let Some(coordination) = store.coordination() else {
        debug!("Store has no coordination capability");
        return Ok(None);
    };

    let leader = coordination.try_become_leader(instance_id, ttl).await?;
    if leader {
        info!(instance_id = %instance_id, "Acquired leadership");
    } else {
        let holder = coordination.get_leader().await?;
        warn!(
            instance_id = %instance_id,
            leader = holder.as_deref().unwrap_or("unknown"),
            "Another controller holds leadership"
        );
    }
    Ok(Some(leader))
}

/// Renew the lease at a third of its length until `shutdown` fires.
pub async fn run_leadership_renewal(
    store: Arc<dyn Store>,
    instance_id: String,
    ttl: Duration,
    shutdown: CancellationToken,
) {
    let Some(coordination) = store.coordination() else {
        return;
    };

    let mut ticker = tokio::time::interval((ttl / 3).max(Duration::from_millis(100)));
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = coordination.renew_leadership(&instance_id, ttl).await {
                    warn!(instance_id = %instance_id, error = %e, "Failed to renew leadership");
                }
            }
            _ = shutdown.cancelled() => return,
        }
    }
}

/// Log every change under `prefix` at debug level until `shutdown` fires.
pub async fn log_changes(store: Arc<dyn Store>, prefix: &str, shutdown: CancellationToken) -> StoreResult<()> {
    let Some(coordination) = store.coordination() else {
        return Ok(());
    };
    let mut changes = coordination.watch(prefix).await?;

    loop {
        tokio::select! {
            change = changes.next() => match change {
                Some(event) => debug!(kind = ?event.kind, key = %event.key, "Record changed"),
                None => return Ok(()),
            },
            _ = shutdown.cancelled() => return Ok(()),
        }
    }
}
