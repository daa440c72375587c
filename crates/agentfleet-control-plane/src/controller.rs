//! Protocol-agnostic controller core.
//!
//! Both transports (framed JSON and gRPC) translate their messages into calls
//! on [`Controller`]; every rule about nodes, agents and tasks lives here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use agentfleet_core::{
    Agent, AgentId, AgentSpec, Node, NodeId, NodeRegistration, NodeStatus, Task, TaskAssignment,
    TaskId, TaskResult, TaskStatus,
};
use agentfleet_proto::MAX_PAYLOAD_LEN;
use agentfleet_store::Store;

use crate::error::{ControllerError, ControllerResult};
use crate::registry::{NodeRegistry, ResultWaiters};

/// Default page size for task listings.
pub const DEFAULT_LIST_LIMIT: usize = 100;

/// Runtime knobs for the controller.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Shared bearer token. `None` disables authentication.
    pub token: Option<String>,
    pub heartbeat_timeout: Duration,
    pub queue_capacity: usize,
    pub enqueue_timeout: Duration,
    pub default_wait: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            token: None,
            heartbeat_timeout: Duration::from_secs(60),
            queue_capacity: 100,
            enqueue_timeout: Duration::from_secs(5),
            default_wait: Duration::from_secs(300),
        }
    }
}

/// A request to run a prompt on a named agent.
#[derive(Debug, Clone, Default)]
pub struct DispatchRequest {
    pub agent_name: String,
    pub prompt: String,
    pub metadata: HashMap<String, String>,
    pub priority: i32,
    pub task_type: String,

    /// Block until the node reports back.
    pub wait: bool,

    /// Wait deadline. `None` or zero uses the configured default.
    pub timeout: Option<Duration>,
}

impl DispatchRequest {
    pub fn new(agent_name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    /// Builder method to wait for the result, up to `timeout`.
    pub fn wait_for(mut self, timeout: Option<Duration>) -> Self {
        self.wait = true;
        self.timeout = timeout;
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = task_type.into();
        self
    }
}

/// What the caller of a dispatch learns.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub task_id: TaskId,

    /// `dispatched` for fire-and-forget, otherwise the terminal status or
    /// `timeout`.
    pub status: TaskStatus,
    pub result: String,
    pub error: Option<String>,
}

impl DispatchOutcome {
    fn dispatched(task_id: TaskId) -> Self {
        Self {
            task_id,
            status: TaskStatus::Dispatched,
            result: String::new(),
            error: None,
        }
    }

    fn from_result(result: TaskResult) -> Self {
        let status = if result.is_success() {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        Self {
            task_id: result.task_id,
            status,
            result: result.result,
            error: result.error,
        }
    }
}

/// Why a task could not be placed on a node queue.
enum HandOffError {
    Full,
    Gone,
}

/// Filters for task listings.
#[derive(Debug, Clone)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub agent_name: Option<String>,
    pub limit: usize,
}

impl Default for TaskFilter {
    fn default() -> Self {
        Self {
            status: None,
            agent_name: None,
            limit: DEFAULT_LIST_LIMIT,
        }
    }
}

/// The control plane's shared core.
pub struct Controller {
    store: Arc<dyn Store>,
    registry: NodeRegistry,
    waiters: ResultWaiters,
    settings: ControllerSettings,
    shutdown: CancellationToken,

    /// Serializes read-modify-write of persisted node and task records.
    record_updates: Mutex<()>,
}

impl Controller {
    pub fn new(store: Arc<dyn Store>, settings: ControllerSettings, shutdown: CancellationToken) -> Self {
        Self {
            store,
            registry: NodeRegistry::new(),
            waiters: ResultWaiters::new(),
            settings,
            shutdown,
            record_updates: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    #[cfg(test)]
    pub(crate) fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Number of live node sessions.
    pub fn connected_count(&self) -> usize {
        self.registry.len()
    }

    /// Check a presented bearer token against the configured one.
    pub fn authorize(&self, token: Option<&str>) -> ControllerResult<()> {
        match &self.settings.token {
            Some(expected) if token != Some(expected.as_str()) => Err(ControllerError::Unauthorized),
            _ => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Node lifecycle
    // ------------------------------------------------------------------

    /// Persist a new `ready` node and open its session.
    pub async fn register_node(&self, registration: NodeRegistration) -> ControllerResult<NodeId> {
        if registration.name.is_empty() {
            return Err(ControllerError::InvalidArgument("node name is required".into()));
        }

        let node = {
            let _guard = self.record_updates.lock().await;
            let node_id = self.unused_node_id().await?;
            let node = Node::new(node_id, registration);
            self.store.save_node(&node).await?;
            node
        };
        let node_id = node.id.clone();
        self.registry.open(node_id.clone(), self.settings.queue_capacity);

        info!(
            node_id = %node_id,
            name = %node.name,
            version = %node.version,
            "Node registered"
        );
        Ok(node_id)
    }

    /// A fresh id that is neither live nor held by a stored node, so an old
    /// node's agents can never resolve to a new session.
    async fn unused_node_id(&self) -> ControllerResult<NodeId> {
        loop {
            let node_id = NodeId::generate();
            if self.registry.contains(&node_id) {
                continue;
            }
            match self.store.get_node(&node_id).await {
                Ok(_) => continue,
                Err(e) if e.is_not_found() => return Ok(node_id),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Take the node's task queue. Each session can be attached once.
    pub fn attach(&self, node_id: &NodeId) -> ControllerResult<mpsc::Receiver<TaskAssignment>> {
        if !self.registry.contains(node_id) {
            return Err(ControllerError::NodeNotConnected(node_id.clone()));
        }
        let rx = self
            .registry
            .attach(node_id)
            .ok_or_else(|| ControllerError::AlreadyAttached(node_id.clone()))?;
        debug!(node_id = %node_id, "Task queue attached");
        Ok(rx)
    }

    /// Record a heartbeat. A `not-ready` node becomes `ready` again.
    pub async fn heartbeat(&self, node_id: &NodeId) -> ControllerResult<DateTime<Utc>> {
        let now = Utc::now();
        if !self.registry.touch(node_id, now) {
            return Err(ControllerError::NodeNotConnected(node_id.clone()));
        }

        let _guard = self.record_updates.lock().await;
        let mut node = self.store.get_node(node_id).await?;
        node.touch(now);
        if node.status != NodeStatus::Ready {
            info!(node_id = %node_id, previous = %node.status, "Node ready again");
            node.status = NodeStatus::Ready;
        }
        self.store.save_node(&node).await?;

        debug!(node_id = %node_id, "Heartbeat");
        Ok(node.last_seen)
    }

    /// Drop the node's session and persist it `disconnected`. Its agents and
    /// in-flight tasks are left as they are.
    pub async fn disconnect(&self, node_id: &NodeId) -> ControllerResult<()> {
        if !self.registry.remove(node_id) {
            return Ok(());
        }

        let _guard = self.record_updates.lock().await;
        match self.store.get_node(node_id).await {
            Ok(mut node) => {
                node.status = NodeStatus::Disconnected;
                self.store.save_node(&node).await?;
            }
            Err(e) if e.is_not_found() => {
                warn!(node_id = %node_id, "Disconnected node has no record");
            }
            Err(e) => return Err(e.into()),
        }

        info!(node_id = %node_id, "Node disconnected");
        Ok(())
    }

    /// Explicit deregistration by a connected node.
    pub async fn deregister_node(&self, node_id: &NodeId) -> ControllerResult<()> {
        if !self.registry.contains(node_id) {
            return Err(ControllerError::NodeNotConnected(node_id.clone()));
        }
        info!(node_id = %node_id, "Node deregistering");
        self.disconnect(node_id).await
    }

    /// Mark every session with an old heartbeat `not-ready`. Sessions are kept.
    pub async fn sweep_stale(&self, now: DateTime<Utc>) -> Vec<NodeId> {
        let mut marked = Vec::new();
        for node_id in self.registry.stale(now, self.settings.heartbeat_timeout) {
            match self.mark_not_ready(&node_id).await {
                Ok(true) => marked.push(node_id),
                Ok(false) => {}
                Err(e) => warn!(node_id = %node_id, error = %e, "Failed to mark node not-ready"),
            }
        }
        marked
    }

    async fn mark_not_ready(&self, node_id: &NodeId) -> ControllerResult<bool> {
        let _guard = self.record_updates.lock().await;
        let mut node = self.store.get_node(node_id).await?;
        if node.status != NodeStatus::Ready {
            return Ok(false);
        }
        node.status = NodeStatus::NotReady;
        self.store.save_node(&node).await?;

        warn!(
            node_id = %node_id,
            last_seen = %node.last_seen,
            "Heartbeat timeout, node marked not-ready"
        );
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Agents
    // ------------------------------------------------------------------

    /// Persist an agent hosted by `node_id` and link it from the node record.
    pub async fn register_agent(&self, node_id: &NodeId, spec: AgentSpec) -> ControllerResult<AgentId> {
        if !self.registry.contains(node_id) {
            return Err(ControllerError::NodeNotConnected(node_id.clone()));
        }
        if spec.name.is_empty() {
            return Err(ControllerError::InvalidArgument("agent name is required".into()));
        }

        let agent = Agent::new(node_id.clone(), spec);
        self.store.save_agent(&agent).await?;

        {
            let _guard = self.record_updates.lock().await;
            let mut node = self.store.get_node(node_id).await?;
            node.add_agent(agent.id.clone());
            self.store.save_node(&node).await?;
        }

        info!(
            node_id = %node_id,
            agent_id = %agent.id,
            agent = %agent.name,
            "Agent registered"
        );
        Ok(agent.id)
    }

    pub async fn deregister_agent(&self, node_id: &NodeId, agent_id: &AgentId) -> ControllerResult<()> {
        let agent = self.store.get_agent(agent_id).await?;
        if &agent.node_id != node_id {
            return Err(ControllerError::InvalidArgument(format!(
                "agent {agent_id} is not hosted by node {node_id}"
            )));
        }
        self.store.delete_agent(agent_id).await?;

        let _guard = self.record_updates.lock().await;
        match self.store.get_node(node_id).await {
            Ok(mut node) => {
                if node.remove_agent(agent_id) {
                    self.store.save_node(&node).await?;
                }
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        info!(node_id = %node_id, agent_id = %agent_id, agent = %agent.name, "Agent deregistered");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Resolve the agent, persist the task, hand it to the node and
    /// optionally wait for the result.
    pub async fn dispatch(&self, request: DispatchRequest) -> ControllerResult<DispatchOutcome> {
        if self.shutdown.is_cancelled() {
            return Err(ControllerError::ShuttingDown);
        }
        if request.agent_name.is_empty() {
            return Err(ControllerError::InvalidArgument("agent name is required".into()));
        }
        if request.prompt.len() > MAX_PAYLOAD_LEN {
            return Err(ControllerError::InvalidArgument(format!(
                "prompt exceeds {MAX_PAYLOAD_LEN} bytes"
            )));
        }

        let (agent, queue) = self.resolve(&request.agent_name).await?;

        let mut task = Task::new(&agent, request.prompt)
            .with_type(request.task_type)
            .with_priority(request.priority)
            .with_metadata(request.metadata);
        self.store.save_task(&task).await?;

        let task_id = task.id.clone();
        let waiter = request.wait.then(|| self.waiters.register(task_id.clone()));

        match self.enqueue(&queue, &task).await {
            Ok(()) => {}
            Err(HandOffError::Gone) => {
                // The session closed after resolution; nothing was handed off.
                self.waiters.cancel(&task_id);
                self.store.delete_task(&task_id).await?;
                debug!(task_id = %task_id, node_id = %task.node_id, "Node left during dispatch");
                return Err(ControllerError::AgentUnavailable(task.agent_name));
            }
            Err(HandOffError::Full) => {
                let err = ControllerError::QueueFull(task.node_id.clone());
                self.waiters.cancel(&task_id);
                task.fail(err.to_string());
                self.store.save_task(&task).await?;
                warn!(task_id = %task_id, node_id = %task.node_id, error = %err, "Task hand-off failed");
                return Err(err);
            }
        }

        self.mark_dispatched(&task_id).await?;

        info!(
            task_id = %task_id,
            node_id = %task.node_id,
            agent = %task.agent_name,
            wait = request.wait,
            "Task dispatched"
        );

        match waiter {
            None => Ok(DispatchOutcome::dispatched(task_id)),
            Some(rx) => {
                let timeout = request
                    .timeout
                    .filter(|t| !t.is_zero())
                    .unwrap_or(self.settings.default_wait);
                self.wait_for_result(task_id, rx, timeout).await
            }
        }
    }

    /// First agent with this name whose node has an attached session.
    async fn resolve(&self, agent_name: &str) -> ControllerResult<(Agent, mpsc::Sender<TaskAssignment>)> {
        let agents = self.store.list_agents().await?;
        agents
            .into_iter()
            .filter(|agent| agent.name == agent_name)
            .find_map(|agent| self.registry.sender(&agent.node_id).map(|tx| (agent, tx)))
            .ok_or_else(|| ControllerError::AgentUnavailable(agent_name.to_string()))
    }

    async fn enqueue(&self, queue: &mpsc::Sender<TaskAssignment>, task: &Task) -> Result<(), HandOffError> {
        match queue
            .send_timeout(task.assignment(), self.settings.enqueue_timeout)
            .await
        {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(HandOffError::Full),
            Err(SendTimeoutError::Closed(_)) => Err(HandOffError::Gone),
        }
    }

    /// Advance a freshly queued task to `dispatched`, unless the node already
    /// reported on it.
    async fn mark_dispatched(&self, task_id: &TaskId) -> ControllerResult<()> {
        let _guard = self.record_updates.lock().await;
        let mut task = self.store.get_task(task_id).await?;
        if task.status == TaskStatus::Pending {
            task.mark_dispatched();
            self.store.save_task(&task).await?;
        }
        Ok(())
    }

    async fn wait_for_result(
        &self,
        task_id: TaskId,
        rx: oneshot::Receiver<TaskResult>,
        timeout: Duration,
    ) -> ControllerResult<DispatchOutcome> {
        tokio::select! {
            result = rx => match result {
                Ok(result) => Ok(DispatchOutcome::from_result(result)),
                Err(_) => Err(ControllerError::ShuttingDown),
            },
            _ = tokio::time::sleep(timeout) => {
                self.waiters.cancel(&task_id);
                info!(task_id = %task_id, timeout_secs = timeout.as_secs_f64(), "Timed out waiting for task result");
                Ok(DispatchOutcome {
                    task_id,
                    status: TaskStatus::Timeout,
                    result: String::new(),
                    error: Some(format!("timed out after {}s waiting for result", timeout.as_secs_f64())),
                })
            }
            _ = self.shutdown.cancelled() => {
                self.waiters.cancel(&task_id);
                Err(ControllerError::ShuttingDown)
            }
        }
    }

    // ------------------------------------------------------------------
    // Node reports
    // ------------------------------------------------------------------

    /// Record a node's result and wake the waiting caller, if any.
    pub async fn report_result(&self, node_id: &NodeId, result: TaskResult) -> ControllerResult<()> {
        {
            let _guard = self.record_updates.lock().await;
            let mut task = self.store.get_task(&result.task_id).await?;
            if &task.node_id != node_id {
                return Err(ControllerError::WrongNode {
                    task_id: task.id,
                    node_id: node_id.clone(),
                });
            }
            if task.is_terminal() {
                warn!(task_id = %task.id, status = %task.status, "Ignoring result for finished task");
                return Ok(());
            }
            task.apply_result(&result);
            self.store.save_task(&task).await?;

            info!(
                task_id = %task.id,
                node_id = %node_id,
                status = %task.status,
                "Task finished"
            );
        }

        if !self.waiters.deliver(&result) {
            info!(task_id = %result.task_id, late = true, "Result recorded with no waiting caller");
        }
        Ok(())
    }

    /// Record intermediate progress. Only `running` changes the record.
    pub async fn report_progress(
        &self,
        node_id: &NodeId,
        task_id: &TaskId,
        status: TaskStatus,
    ) -> ControllerResult<()> {
        if status != TaskStatus::Running {
            debug!(task_id = %task_id, status = %status, "Ignoring progress status");
            return Ok(());
        }

        let _guard = self.record_updates.lock().await;
        let mut task = self.store.get_task(task_id).await?;
        if &task.node_id != node_id {
            return Err(ControllerError::WrongNode {
                task_id: task.id,
                node_id: node_id.clone(),
            });
        }
        if matches!(task.status, TaskStatus::Pending | TaskStatus::Dispatched) {
            task.status = TaskStatus::Running;
            task.started_at.get_or_insert_with(Utc::now);
            self.store.save_task(&task).await?;
            debug!(task_id = %task_id, "Task running");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn get_task(&self, task_id: &TaskId) -> ControllerResult<Task> {
        Ok(self.store.get_task(task_id).await?)
    }

    pub async fn list_nodes(&self) -> ControllerResult<Vec<Node>> {
        Ok(self.store.list_nodes().await?)
    }

    pub async fn list_agents(&self, node_id: Option<&NodeId>) -> ControllerResult<Vec<Agent>> {
        let agents = match node_id {
            Some(node_id) => self.store.list_agents_by_node(node_id).await?,
            None => self.store.list_agents().await?,
        };
        Ok(agents)
    }

    /// Matching tasks, newest first, at most `filter.limit` of them.
    pub async fn list_tasks(&self, filter: &TaskFilter) -> ControllerResult<Vec<Task>> {
        let limit = if filter.limit == 0 {
            DEFAULT_LIST_LIMIT
        } else {
            filter.limit
        };

        let tasks = self.store.list_tasks().await?;
        Ok(tasks
            .into_iter()
            .rev()
            .filter(|t| filter.status.map_or(true, |s| t.status == s))
            .filter(|t| filter.agent_name.as_deref().map_or(true, |a| t.agent_name == a))
            .take(limit)
            .collect())
    }

    /// Stop accepting dispatches and release blocked callers.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.waiters.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentfleet_store::MemoryStore;
    use std::time::Instant;

    fn controller_with(settings: ControllerSettings) -> Arc<Controller> {
        Arc::new(Controller::new(
            Arc::new(MemoryStore::new()),
            settings,
            CancellationToken::new(),
        ))
    }

    fn controller() -> Arc<Controller> {
        controller_with(ControllerSettings::default())
    }

    /// Memory store that reports a stored node for the first `taken` unknown
    /// ids it is asked about.
    struct TakenIdsStore {
        inner: MemoryStore,
        taken: usize,
        seen: std::sync::Mutex<Vec<NodeId>>,
    }

    #[async_trait::async_trait]
    impl Store for TakenIdsStore {
        async fn get_node(&self, id: &NodeId) -> agentfleet_store::StoreResult<Node> {
            match self.inner.get_node(id).await {
                Err(e) if e.is_not_found() => {
                    let mut seen = self.seen.lock().unwrap();
                    if seen.len() < self.taken {
                        seen.push(id.clone());
                        Ok(Node::new(id.clone(), NodeRegistration::new("old-node")))
                    } else {
                        Err(e)
                    }
                }
                other => other,
            }
        }
        async fn list_nodes(&self) -> agentfleet_store::StoreResult<Vec<Node>> {
            self.inner.list_nodes().await
        }
        async fn save_node(&self, node: &Node) -> agentfleet_store::StoreResult<()> {
            self.inner.save_node(node).await
        }
        async fn delete_node(&self, id: &NodeId) -> agentfleet_store::StoreResult<()> {
            self.inner.delete_node(id).await
        }
        async fn get_agent(&self, id: &AgentId) -> agentfleet_store::StoreResult<Agent> {
            self.inner.get_agent(id).await
        }
        async fn list_agents(&self) -> agentfleet_store::StoreResult<Vec<Agent>> {
            self.inner.list_agents().await
        }
        async fn save_agent(&self, agent: &Agent) -> agentfleet_store::StoreResult<()> {
            self.inner.save_agent(agent).await
        }
        async fn delete_agent(&self, id: &AgentId) -> agentfleet_store::StoreResult<()> {
            self.inner.delete_agent(id).await
        }
        async fn get_task(&self, id: &TaskId) -> agentfleet_store::StoreResult<Task> {
            self.inner.get_task(id).await
        }
        async fn list_tasks(&self) -> agentfleet_store::StoreResult<Vec<Task>> {
            self.inner.list_tasks().await
        }
        async fn save_task(&self, task: &Task) -> agentfleet_store::StoreResult<()> {
            self.inner.save_task(task).await
        }
        async fn delete_task(&self, id: &TaskId) -> agentfleet_store::StoreResult<()> {
            self.inner.delete_task(id).await
        }
        async fn close(&self) -> agentfleet_store::StoreResult<()> {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn test_register_skips_ids_held_by_stored_nodes() {
        let store = Arc::new(TakenIdsStore {
            inner: MemoryStore::new(),
            taken: 3,
            seen: std::sync::Mutex::new(Vec::new()),
        });
        let controller = Controller::new(store.clone(), ControllerSettings::default(), CancellationToken::new());

        let node_id = controller
            .register_node(NodeRegistration::new("worker-2"))
            .await
            .unwrap();

        let seen = store.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 3);
        assert!(!seen.contains(&node_id));
        assert_eq!(store.inner.list_nodes().await.unwrap().len(), 1);
        assert_eq!(store.inner.get_node(&node_id).await.unwrap().name, "worker-2");
    }

    #[tokio::test]
    async fn test_dispatch_to_closing_session_persists_nothing() {
        let controller = controller();
        let (_node_id, rx) = connected_node(&controller, "coder").await;
        // The session's writer is gone but the session has not left the registry yet.
        drop(rx);

        let err = controller
            .dispatch(DispatchRequest::new("coder", "hello").wait_for(Some(Duration::from_secs(1))))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::AgentUnavailable(_)));
        assert!(controller.list_tasks(&TaskFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_prompt_is_rejected() {
        let controller = controller();
        let (_node_id, _rx) = connected_node(&controller, "coder").await;

        let err = controller
            .dispatch(DispatchRequest::new("coder", "x".repeat(MAX_PAYLOAD_LEN + 1)))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidArgument(_)));
        assert!(controller.list_tasks(&TaskFilter::default()).await.unwrap().is_empty());
    }

    /// Register a node with one agent and attach its queue.
    async fn connected_node(
        controller: &Controller,
        agent: &str,
    ) -> (NodeId, mpsc::Receiver<TaskAssignment>) {
        let node_id = controller
            .register_node(NodeRegistration::new("worker-1"))
            .await
            .unwrap();
        let rx = controller.attach(&node_id).unwrap();
        controller
            .register_agent(&node_id, AgentSpec::new(agent))
            .await
            .unwrap();
        (node_id, rx)
    }

    #[tokio::test]
    async fn test_register_assigns_id_and_persists_ready() {
        let controller = controller();
        let node_id = controller
            .register_node(NodeRegistration::new("worker-1"))
            .await
            .unwrap();

        assert!(!node_id.is_empty());
        assert_ne!(node_id.as_str(), "worker-1");

        let node = controller.store().get_node(&node_id).await.unwrap();
        assert_eq!(node.status, NodeStatus::Ready);
        assert_eq!(node.name, "worker-1");
        assert_eq!(controller.connected_count(), 1);
    }

    #[tokio::test]
    async fn test_authorize() {
        let open = controller();
        assert!(open.authorize(None).is_ok());
        assert!(open.authorize(Some("anything")).is_ok());

        let locked = controller_with(ControllerSettings {
            token: Some("secret".into()),
            ..Default::default()
        });
        assert!(matches!(locked.authorize(None), Err(ControllerError::Unauthorized)));
        assert!(matches!(
            locked.authorize(Some("wrong")),
            Err(ControllerError::Unauthorized)
        ));
        assert!(locked.authorize(Some("secret")).is_ok());
    }

    #[tokio::test]
    async fn test_attach_only_once() {
        let controller = controller();
        let node_id = controller
            .register_node(NodeRegistration::new("worker-1"))
            .await
            .unwrap();

        assert!(controller.attach(&node_id).is_ok());
        assert!(matches!(
            controller.attach(&node_id),
            Err(ControllerError::AlreadyAttached(_))
        ));
        assert!(matches!(
            controller.attach(&NodeId::new("nope")),
            Err(ControllerError::NodeNotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_sweep_marks_only_stale_nodes() {
        let controller = controller();
        let stale = controller
            .register_node(NodeRegistration::new("stale"))
            .await
            .unwrap();
        let fresh = controller
            .register_node(NodeRegistration::new("fresh"))
            .await
            .unwrap();

        let now = Utc::now();
        controller
            .registry
            .set_last_heartbeat(&stale, now - chrono::Duration::seconds(61));
        controller
            .registry
            .set_last_heartbeat(&fresh, now - chrono::Duration::seconds(30));

        let marked = controller.sweep_stale(now).await;
        assert_eq!(marked, vec![stale.clone()]);

        let store = controller.store();
        assert_eq!(store.get_node(&stale).await.unwrap().status, NodeStatus::NotReady);
        assert_eq!(store.get_node(&fresh).await.unwrap().status, NodeStatus::Ready);

        // The session survives and a heartbeat brings the node back.
        assert_eq!(controller.connected_count(), 2);
        controller.heartbeat(&stale).await.unwrap();
        assert_eq!(store.get_node(&stale).await.unwrap().status, NodeStatus::Ready);
    }

    #[tokio::test]
    async fn test_heartbeat_is_idempotent_and_monotonic() {
        let controller = controller();
        let node_id = controller
            .register_node(NodeRegistration::new("worker-1"))
            .await
            .unwrap();

        let first = controller.heartbeat(&node_id).await.unwrap();
        let second = controller.heartbeat(&node_id).await.unwrap();
        assert!(second >= first);

        let node = controller.store().get_node(&node_id).await.unwrap();
        assert_eq!(node.last_seen, second);

        assert!(matches!(
            controller.heartbeat(&NodeId::new("ghost")).await,
            Err(ControllerError::NodeNotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_register_agent_links_node() {
        let controller = controller();
        let (node_id, _rx) = connected_node(&controller, "coder").await;

        let node = controller.store().get_node(&node_id).await.unwrap();
        assert_eq!(node.agent_ids.len(), 1);

        let agents = controller.list_agents(Some(&node_id)).await.unwrap();
        assert_eq!(agents[0].name, "coder");

        controller
            .deregister_agent(&node_id, &agents[0].id)
            .await
            .unwrap();
        let node = controller.store().get_node(&node_id).await.unwrap();
        assert!(node.agent_ids.is_empty());
        assert!(controller.list_agents(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_and_wait_for_result() {
        let controller = controller();
        let (node_id, mut rx) = connected_node(&controller, "coder").await;

        let node = {
            let controller = controller.clone();
            tokio::spawn(async move {
                let assignment = rx.recv().await.unwrap();
                assert_eq!(assignment.prompt, "write tests");
                controller
                    .report_progress(&node_id, &assignment.task_id, TaskStatus::Running)
                    .await
                    .unwrap();
                controller
                    .report_result(&node_id, TaskResult::success(assignment.task_id, "done"))
                    .await
                    .unwrap();
            })
        };

        let outcome = controller
            .dispatch(DispatchRequest::new("coder", "write tests").wait_for(Some(Duration::from_secs(5))))
            .await
            .unwrap();
        node.await.unwrap();

        assert_eq!(outcome.status, TaskStatus::Completed);
        assert_eq!(outcome.result, "done");

        let task = controller.get_task(&outcome.task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result, "done");
        assert!(task.started_at.is_some());
        assert!(task.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_dispatch_without_wait_returns_dispatched() {
        let controller = controller();
        let (_node_id, mut rx) = connected_node(&controller, "coder").await;

        let outcome = controller
            .dispatch(DispatchRequest::new("coder", "hi"))
            .await
            .unwrap();
        assert_eq!(outcome.status, TaskStatus::Dispatched);

        let assignment = rx.recv().await.unwrap();
        assert_eq!(assignment.task_id, outcome.task_id);
        let task = controller.get_task(&outcome.task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Dispatched);
    }

    #[tokio::test]
    async fn test_runner_error_fails_task() {
        let controller = controller();
        let (node_id, mut rx) = connected_node(&controller, "coder").await;

        let node = {
            let controller = controller.clone();
            tokio::spawn(async move {
                let assignment = rx.recv().await.unwrap();
                controller
                    .report_result(&node_id, TaskResult::failure(assignment.task_id, "boom"))
                    .await
                    .unwrap();
            })
        };

        let outcome = controller
            .dispatch(DispatchRequest::new("coder", "hi").wait_for(Some(Duration::from_secs(5))))
            .await
            .unwrap();
        node.await.unwrap();

        assert_eq!(outcome.status, TaskStatus::Failed);
        assert_eq!(outcome.error.as_deref(), Some("boom"));
        let task = controller.get_task(&outcome.task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_unreachable_agent_persists_nothing() {
        let controller = controller();

        // Agent record exists, but its node never attached a transport.
        let node_id = controller
            .register_node(NodeRegistration::new("worker-1"))
            .await
            .unwrap();
        controller
            .register_agent(&node_id, AgentSpec::new("coder"))
            .await
            .unwrap();

        let err = controller
            .dispatch(DispatchRequest::new("coder", "hi"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "agent not found or no connected node running it");

        let err = controller
            .dispatch(DispatchRequest::new("nobody", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::AgentUnavailable(_)));

        assert!(controller.store().list_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_times_out_and_keeps_record() {
        let controller = controller();
        let (_node_id, _rx) = connected_node(&controller, "coder").await;

        let started = Instant::now();
        let outcome = controller
            .dispatch(DispatchRequest::new("coder", "hi").wait_for(Some(Duration::from_secs(1))))
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(outcome.status, TaskStatus::Timeout);
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_secs(3));

        let task = controller.get_task(&outcome.task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Dispatched);
    }

    #[tokio::test]
    async fn test_late_result_is_persisted() {
        let controller = controller();
        let (node_id, mut rx) = connected_node(&controller, "coder").await;

        let outcome = controller
            .dispatch(DispatchRequest::new("coder", "hi").wait_for(Some(Duration::from_millis(50))))
            .await
            .unwrap();
        assert_eq!(outcome.status, TaskStatus::Timeout);

        let assignment = rx.recv().await.unwrap();
        controller
            .report_result(&node_id, TaskResult::success(assignment.task_id, "late"))
            .await
            .unwrap();

        let task = controller.get_task(&outcome.task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result, "late");
    }

    #[tokio::test]
    async fn test_result_from_other_node_is_rejected() {
        let controller = controller();
        let (_node_id, mut rx) = connected_node(&controller, "coder").await;

        controller
            .dispatch(DispatchRequest::new("coder", "hi"))
            .await
            .unwrap();
        let assignment = rx.recv().await.unwrap();

        let err = controller
            .report_result(&NodeId::new("intruder"), TaskResult::success(assignment.task_id, "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::WrongNode { .. }));
    }

    #[tokio::test]
    async fn test_full_queue_fails_task() {
        let controller = controller_with(ControllerSettings {
            queue_capacity: 1,
            enqueue_timeout: Duration::from_millis(50),
            ..Default::default()
        });
        let (node_id, _rx) = connected_node(&controller, "coder").await;

        controller
            .dispatch(DispatchRequest::new("coder", "first"))
            .await
            .unwrap();
        let err = controller
            .dispatch(DispatchRequest::new("coder", "second").wait_for(None))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), format!("task queue full for node {node_id}"));

        let failed = controller
            .list_tasks(&TaskFilter {
                status: Some(TaskStatus::Failed),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].prompt, "second");
        assert_eq!(controller.waiters.len(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_cleans_up_session() {
        let controller = controller();
        let (node_id, _rx) = connected_node(&controller, "coder").await;

        controller.disconnect(&node_id).await.unwrap();

        assert_eq!(controller.connected_count(), 0);
        let node = controller.store().get_node(&node_id).await.unwrap();
        assert_eq!(node.status, NodeStatus::Disconnected);
        assert_eq!(controller.list_agents(None).await.unwrap().len(), 1);

        let err = controller
            .dispatch(DispatchRequest::new("coder", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::AgentUnavailable(_)));

        // A second close is a no-op.
        controller.disconnect(&node_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_tasks_filters_newest_first() {
        let controller = controller();
        let (_node_id, _rx) = connected_node(&controller, "coder").await;

        for prompt in ["a", "b", "c"] {
            controller
                .dispatch(DispatchRequest::new("coder", prompt))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let tasks = controller
            .list_tasks(&TaskFilter {
                limit: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        let prompts: Vec<_> = tasks.iter().map(|t| t.prompt.as_str()).collect();
        assert_eq!(prompts, vec!["c", "b"]);

        let none = controller
            .list_tasks(&TaskFilter {
                agent_name: Some("reviewer".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_rejects_dispatch() {
        let controller = controller();
        let (_node_id, _rx) = connected_node(&controller, "coder").await;

        controller.shutdown();
        assert!(matches!(
            controller.dispatch(DispatchRequest::new("coder", "hi")).await,
            Err(ControllerError::ShuttingDown)
        ));
    }
}
