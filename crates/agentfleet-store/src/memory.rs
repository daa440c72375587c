//! In-memory store. Nothing survives the process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use agentfleet_core::{Agent, AgentId, Node, NodeId, Task, TaskId};

use crate::error::{EntityKind, StoreError, StoreResult};
use crate::store::Store;

/// Process-local store without coordination support.
#[derive(Default)]
pub struct MemoryStore {
    nodes: RwLock<HashMap<NodeId, Node>>,
    agents: RwLock<HashMap<AgentId, Agent>>,
    tasks: RwLock<HashMap<TaskId, Task>>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_node(&self, id: &NodeId) -> StoreResult<Node> {
        self.ensure_open()?;
        self.nodes
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(EntityKind::Node, id.as_str()))
    }

    async fn list_nodes(&self) -> StoreResult<Vec<Node>> {
        self.ensure_open()?;
        let mut nodes: Vec<Node> = self.nodes.read().await.values().cloned().collect();
        nodes.sort_by(|a, b| a.joined_at.cmp(&b.joined_at));
        Ok(nodes)
    }

    async fn save_node(&self, node: &Node) -> StoreResult<()> {
        self.ensure_open()?;
        self.nodes
            .write()
            .await
            .insert(node.id.clone(), node.clone());
        Ok(())
    }

    async fn delete_node(&self, id: &NodeId) -> StoreResult<()> {
        self.ensure_open()?;
        self.nodes
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(EntityKind::Node, id.as_str()))
    }

    async fn get_agent(&self, id: &AgentId) -> StoreResult<Agent> {
        self.ensure_open()?;
        self.agents
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(EntityKind::Agent, id.as_str()))
    }

    async fn list_agents(&self) -> StoreResult<Vec<Agent>> {
        self.ensure_open()?;
        let mut agents: Vec<Agent> = self.agents.read().await.values().cloned().collect();
        agents.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(agents)
    }

    async fn save_agent(&self, agent: &Agent) -> StoreResult<()> {
        self.ensure_open()?;
        self.agents
            .write()
            .await
            .insert(agent.id.clone(), agent.clone());
        Ok(())
    }

    async fn delete_agent(&self, id: &AgentId) -> StoreResult<()> {
        self.ensure_open()?;
        self.agents
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(EntityKind::Agent, id.as_str()))
    }

    async fn get_task(&self, id: &TaskId) -> StoreResult<Task> {
        self.ensure_open()?;
        self.tasks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(EntityKind::Task, id.as_str()))
    }

    async fn list_tasks(&self) -> StoreResult<Vec<Task>> {
        self.ensure_open()?;
        let mut tasks: Vec<Task> = self.tasks.read().await.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    async fn save_task(&self, task: &Task) -> StoreResult<()> {
        self.ensure_open()?;
        self.tasks
            .write()
            .await
            .insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn delete_task(&self, id: &TaskId) -> StoreResult<()> {
        self.ensure_open()?;
        self.tasks
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(EntityKind::Task, id.as_str()))
    }

    async fn close(&self) -> StoreResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentfleet_core::NodeRegistration;

    #[tokio::test]
    async fn test_memory_store_has_no_coordination() {
        let store = MemoryStore::new();
        assert!(store.coordination().is_none());
    }

    #[tokio::test]
    async fn test_save_overwrites() {
        let store = MemoryStore::new();
        let mut node = Node::new(NodeId::generate(), NodeRegistration::new("worker-1"));
        store.save_node(&node).await.unwrap();

        node.name = "worker-2".to_string();
        store.save_node(&node).await.unwrap();

        let nodes = store.list_nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name, "worker-2");
    }
}
