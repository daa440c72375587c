//! Coordination capability: leader election and change watches.
//!
//! A distributed backend implements this against its coordination service.
//! [`LocalCoordinator`] is the single-process version used by [`FileStore`]:
//! the lease lives in memory, so it gives no mutual exclusion across
//! processes.
//!
//! [`FileStore`]: crate::FileStore

use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};

const WATCH_BUFFER: usize = 256;

/// Kind of change reported by a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchEventKind {
    Put,
    Delete,
}

/// One change to a stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub kind: WatchEventKind,

    /// `<collection>/<id>`, e.g. `nodes/3f9a1c2e`.
    pub key: String,

    /// The record as JSON; `None` for deletes.
    pub value: Option<String>,
}

/// Stream of changes under a key prefix.
pub type WatchStream = Pin<Box<dyn Stream<Item = WatchEvent> + Send>>;

/// Operations a multi-controller deployment needs from its store.
#[async_trait]
pub trait CoordinationCapable: Send + Sync {
    /// Claim leadership for `ttl` unless another live holder has it.
    /// Returns true if `id` is the leader afterwards.
    async fn try_become_leader(&self, id: &str, ttl: Duration) -> StoreResult<bool>;

    /// Extend the lease held by `id`.
    async fn renew_leadership(&self, id: &str, ttl: Duration) -> StoreResult<()>;

    /// Current unexpired leader, if any.
    async fn get_leader(&self) -> StoreResult<Option<String>>;

    /// Changes to keys starting with `prefix`, from now on.
    async fn watch(&self, prefix: &str) -> StoreResult<WatchStream>;
}

struct Lease {
    holder: String,
    expires_at: Instant,
}

/// In-process leader lease and change feed.
pub struct LocalCoordinator {
    lease: Mutex<Option<Lease>>,
    events: broadcast::Sender<WatchEvent>,
}

impl LocalCoordinator {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            lease: Mutex::new(None),
            events,
        }
    }

    /// Announce a change to watchers. No-op when nobody watches.
    pub fn publish(&self, kind: WatchEventKind, key: String, value: Option<String>) {
        let _ = self.events.send(WatchEvent { kind, key, value });
    }

    fn lock_lease(&self) -> std::sync::MutexGuard<'_, Option<Lease>> {
        // A poisoned lease only means a panic elsewhere; the data is a plain value.
        self.lease.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Default for LocalCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationCapable for LocalCoordinator {
    async fn try_become_leader(&self, id: &str, ttl: Duration) -> StoreResult<bool> {
        let now = Instant::now();
        let mut lease = self.lock_lease();

        let available = match lease.as_ref() {
            None => true,
            Some(current) => current.holder == id || current.expires_at <= now,
        };

        if available {
            *lease = Some(Lease {
                holder: id.to_string(),
                expires_at: now + ttl,
            });
            info!(leader = %id, ttl_secs = ttl.as_secs(), "Leadership acquired");
        } else {
            debug!(candidate = %id, "Leadership held by another instance");
        }

        Ok(available)
    }

    async fn renew_leadership(&self, id: &str, ttl: Duration) -> StoreResult<()> {
        let now = Instant::now();
        let mut lease = self.lock_lease();

        match lease.as_mut() {
            Some(current) if current.holder == id && current.expires_at > now => {
                current.expires_at = now + ttl;
                Ok(())
            }
            _ => Err(StoreError::NotLeader(id.to_string())),
        }
    }

    async fn get_leader(&self) -> StoreResult<Option<String>> {
        let now = Instant::now();
        let lease = self.lock_lease();
        Ok(lease
            .as_ref()
            .filter(|l| l.expires_at > now)
            .map(|l| l.holder.clone()))
    }

    async fn watch(&self, prefix: &str) -> StoreResult<WatchStream> {
        let prefix = prefix.to_string();
        let stream = BroadcastStream::new(self.events.subscribe())
            .filter_map(move |event| event.ok().filter(|e| e.key.starts_with(&prefix)));
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_leader_lease_expires() {
        let coord = LocalCoordinator::new();
        let ttl = Duration::from_secs(10);

        assert!(coord.try_become_leader("a", ttl).await.unwrap());
        assert!(!coord.try_become_leader("b", ttl).await.unwrap());
        assert_eq!(coord.get_leader().await.unwrap().as_deref(), Some("a"));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(coord.get_leader().await.unwrap(), None);
        assert!(coord.renew_leadership("a", ttl).await.is_err());
        assert!(coord.try_become_leader("b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_renew_by_holder() {
        let coord = LocalCoordinator::new();
        let ttl = Duration::from_secs(10);

        coord.try_become_leader("a", ttl).await.unwrap();
        coord.renew_leadership("a", ttl).await.unwrap();
        assert!(matches!(
            coord.renew_leadership("b", ttl).await,
            Err(StoreError::NotLeader(_))
        ));
    }

    #[tokio::test]
    async fn test_watch_filters_by_prefix() {
        let coord = LocalCoordinator::new();
        let mut nodes = coord.watch("nodes/").await.unwrap();

        coord.publish(WatchEventKind::Put, "tasks/t1".into(), Some("{}".into()));
        coord.publish(WatchEventKind::Delete, "nodes/n1".into(), None);

        let event = nodes.next().await.unwrap();
        assert_eq!(event.kind, WatchEventKind::Delete);
        assert_eq!(event.key, "nodes/n1");
    }
}
