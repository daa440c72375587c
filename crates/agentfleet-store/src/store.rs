//! The storage trait shared by all backends.

use async_trait::async_trait;

use agentfleet_core::{Agent, AgentId, Node, NodeId, Task, TaskId};

use crate::coordination::CoordinationCapable;
use crate::error::StoreResult;

/// Persistence for nodes, agents and tasks.
///
/// Every `save_*` call is its own unit of durability; there are no
/// transactions spanning several records. Lookups of missing ids fail with
/// [`StoreError::NotFound`](crate::StoreError::NotFound).
///
/// List operations return records oldest first (nodes by `joined_at`, agents
/// and tasks by `created_at`).
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_node(&self, id: &NodeId) -> StoreResult<Node>;
    async fn list_nodes(&self) -> StoreResult<Vec<Node>>;
    async fn save_node(&self, node: &Node) -> StoreResult<()>;
    async fn delete_node(&self, id: &NodeId) -> StoreResult<()>;

    async fn get_agent(&self, id: &AgentId) -> StoreResult<Agent>;
    async fn list_agents(&self) -> StoreResult<Vec<Agent>>;
    async fn save_agent(&self, agent: &Agent) -> StoreResult<()>;
    async fn delete_agent(&self, id: &AgentId) -> StoreResult<()>;

    /// Agents whose owning node is `node_id`.
    async fn list_agents_by_node(&self, node_id: &NodeId) -> StoreResult<Vec<Agent>> {
        let mut agents = self.list_agents().await?;
        agents.retain(|a| &a.node_id == node_id);
        Ok(agents)
    }

    async fn get_task(&self, id: &TaskId) -> StoreResult<Task>;
    async fn list_tasks(&self) -> StoreResult<Vec<Task>>;
    async fn save_task(&self, task: &Task) -> StoreResult<()>;
    async fn delete_task(&self, id: &TaskId) -> StoreResult<()>;

    /// Tasks in a non-terminal status.
    async fn list_pending_tasks(&self) -> StoreResult<Vec<Task>> {
        let mut tasks = self.list_tasks().await?;
        tasks.retain(|t| t.status.is_active());
        Ok(tasks)
    }

    /// Release backend resources. Further calls fail with `Closed`.
    async fn close(&self) -> StoreResult<()>;

    /// Leader election and change watches, for backends that support them.
    fn coordination(&self) -> Option<&dyn CoordinationCapable> {
        None
    }
}
