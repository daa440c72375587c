//! In-memory connection state shared by every transport.
//!
//! Two tables live here:
//! - [`NodeRegistry`]: node id -> live session (task queue + last heartbeat)
//! - [`ResultWaiters`]: task id -> channel of a caller blocked on its result
//!
//! Each table is one `std::sync::Mutex` behind accessor methods. A lock is
//! held only for the map operation itself; the guard type is not `Send`, so
//! holding it across an `.await` does not compile.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};

use agentfleet_core::{NodeId, TaskAssignment, TaskId, TaskResult};

/// A live node connection.
struct NodeSession {
    /// Outbound task queue.
    tx: mpsc::Sender<TaskAssignment>,

    /// Receiving end, parked here until a transport attaches.
    rx: Option<mpsc::Receiver<TaskAssignment>>,

    last_heartbeat: DateTime<Utc>,
}

impl NodeSession {
    fn attached(&self) -> bool {
        self.rx.is_none()
    }
}

/// Connected-node table.
#[derive(Default)]
pub struct NodeRegistry {
    sessions: Mutex<HashMap<NodeId, NodeSession>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<NodeId, NodeSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a session with a bounded task queue. Replaces any previous session.
    pub fn open(&self, node_id: NodeId, capacity: usize) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let session = NodeSession {
            tx,
            rx: Some(rx),
            last_heartbeat: Utc::now(),
        };
        self.lock().insert(node_id, session);
    }

    /// Hand the task queue to a transport. `None` if the node has no session
    /// or a transport already attached.
    pub fn attach(&self, node_id: &NodeId) -> Option<mpsc::Receiver<TaskAssignment>> {
        self.lock().get_mut(node_id).and_then(|s| s.rx.take())
    }

    /// Sender for an attached session's queue.
    pub fn sender(&self, node_id: &NodeId) -> Option<mpsc::Sender<TaskAssignment>> {
        self.lock()
            .get(node_id)
            .filter(|s| s.attached())
            .map(|s| s.tx.clone())
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.lock().contains_key(node_id)
    }

    /// True if a transport is draining this node's queue.
    pub fn is_attached(&self, node_id: &NodeId) -> bool {
        self.lock().get(node_id).is_some_and(|s| s.attached())
    }

    /// Record a heartbeat. The stored instant never moves backwards.
    /// Returns false if the node has no session.
    pub fn touch(&self, node_id: &NodeId, at: DateTime<Utc>) -> bool {
        match self.lock().get_mut(node_id) {
            Some(session) => {
                if at > session.last_heartbeat {
                    session.last_heartbeat = at;
                }
                true
            }
            None => false,
        }
    }

    pub fn last_heartbeat(&self, node_id: &NodeId) -> Option<DateTime<Utc>> {
        self.lock().get(node_id).map(|s| s.last_heartbeat)
    }

    /// Sessions whose last heartbeat is older than `timeout` at `now`.
    pub fn stale(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<NodeId> {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        self.lock()
            .iter()
            .filter(|(_, s)| now.signed_duration_since(s.last_heartbeat) > timeout)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Drop a session, closing its queue once in-flight senders finish.
    pub fn remove(&self, node_id: &NodeId) -> bool {
        self.lock().remove(node_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    #[cfg(test)]
    pub(crate) fn set_last_heartbeat(&self, node_id: &NodeId, at: DateTime<Utc>) {
        if let Some(session) = self.lock().get_mut(node_id) {
            session.last_heartbeat = at;
        }
    }
}

/// Callers blocked on a task result.
#[derive(Default)]
pub struct ResultWaiters {
    waiters: Mutex<HashMap<TaskId, oneshot::Sender<TaskResult>>>,
}

impl ResultWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, oneshot::Sender<TaskResult>>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register interest in `task_id`'s result.
    pub fn register(&self, task_id: TaskId) -> oneshot::Receiver<TaskResult> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(task_id, tx);
        rx
    }

    /// Hand a result to its waiter. Returns false if nobody was waiting.
    /// The waiter is removed, so a task's result is delivered at most once.
    pub fn deliver(&self, result: &TaskResult) -> bool {
        let waiter = self.lock().remove(&result.task_id);
        match waiter {
            Some(tx) => tx.send(result.clone()).is_ok(),
            None => false,
        }
    }

    /// Stop waiting for `task_id`.
    pub fn cancel(&self, task_id: &TaskId) {
        self.lock().remove(task_id);
    }

    /// Drop every waiter; blocked callers observe a closed channel.
    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_once() {
        let registry = NodeRegistry::new();
        let node = NodeId::new("n1");
        registry.open(node.clone(), 4);

        assert!(registry.contains(&node));
        assert!(!registry.is_attached(&node));
        assert!(registry.sender(&node).is_none());

        assert!(registry.attach(&node).is_some());
        assert!(registry.attach(&node).is_none());
        assert!(registry.is_attached(&node));
        assert!(registry.sender(&node).is_some());
    }

    #[test]
    fn test_touch_is_monotonic_and_stale_uses_age() {
        let registry = NodeRegistry::new();
        let node = NodeId::new("n1");
        registry.open(node.clone(), 4);

        let now = Utc::now();
        registry.set_last_heartbeat(&node, now - chrono::Duration::seconds(61));
        assert_eq!(registry.stale(now, Duration::from_secs(60)), vec![node.clone()]);

        assert!(registry.touch(&node, now));
        assert!(registry.touch(&node, now - chrono::Duration::seconds(5)));
        assert_eq!(registry.last_heartbeat(&node), Some(now));
        assert!(registry.stale(now, Duration::from_secs(60)).is_empty());

        assert!(!registry.touch(&NodeId::new("other"), now));
    }

    #[tokio::test]
    async fn test_removed_session_closes_queue() {
        let registry = NodeRegistry::new();
        let node = NodeId::new("n1");
        registry.open(node.clone(), 4);
        let mut rx = registry.attach(&node).unwrap();

        assert!(registry.remove(&node));
        assert!(rx.recv().await.is_none());
        assert!(!registry.remove(&node));
    }

    #[tokio::test]
    async fn test_waiter_receives_result_once() {
        let waiters = ResultWaiters::new();
        let task = TaskId::new("t1");
        let rx = waiters.register(task.clone());

        let result = TaskResult::success(task.clone(), "done");
        assert!(waiters.deliver(&result));
        assert!(!waiters.deliver(&result));
        assert_eq!(rx.await.unwrap().result, "done");
        assert!(waiters.is_empty());
    }
}
