//! File-backed store: one JSON document per record.
//!
//! Layout under the data directory:
//!
//! ```text
//! nodes/<id>.json
//! agents/<id>.json
//! tasks/<id>.json
//! ```
//!
//! Writes go to a temporary file that is renamed into place, so readers never
//! observe a half-written record. The layout is owned by this backend and is
//! not a compatibility contract.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use agentfleet_core::{Agent, AgentId, Node, NodeId, Task, TaskId};

use crate::coordination::{CoordinationCapable, LocalCoordinator, WatchEventKind};
use crate::error::{EntityKind, StoreError, StoreResult};
use crate::store::Store;

const KINDS: [EntityKind; 3] = [EntityKind::Node, EntityKind::Agent, EntityKind::Task];

/// Single-process store persisting records as JSON files.
pub struct FileStore {
    root: PathBuf,
    write_lock: Mutex<()>,
    coordinator: LocalCoordinator,
    closed: AtomicBool,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        for kind in KINDS {
            fs::create_dir_all(root.join(kind.collection())).await?;
        }
        info!(data_dir = %root.display(), "File store opened");

        Ok(Self {
            root,
            write_lock: Mutex::new(()),
            coordinator: LocalCoordinator::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Root data directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    /// Path of a record, or `None` for ids that cannot name a file in the collection.
    fn record_path(&self, kind: EntityKind, id: &str) -> Option<PathBuf> {
        let usable = !id.is_empty()
            && id != "."
            && id != ".."
            && !id.contains(['/', '\\', '\0']);
        usable.then(|| {
            self.root
                .join(kind.collection())
                .join(format!("{id}.json"))
        })
    }

    async fn read<T: DeserializeOwned>(&self, kind: EntityKind, id: &str) -> StoreResult<T> {
        self.ensure_open()?;
        let path = self
            .record_path(kind, id)
            .ok_or_else(|| StoreError::not_found(kind, id))?;

        match fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::not_found(kind, id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn write<T: Serialize>(&self, kind: EntityKind, id: &str, value: &T) -> StoreResult<()> {
        self.ensure_open()?;
        let path = self
            .record_path(kind, id)
            .ok_or_else(|| StoreError::not_found(kind, id))?;
        let json = serde_json::to_string_pretty(value)?;
        let tmp = path.with_extension("json.tmp");

        {
            let _guard = self.write_lock.lock().await;
            fs::write(&tmp, json.as_bytes()).await?;
            fs::rename(&tmp, &path).await?;
        }

        debug!(kind = %kind, id = %id, "Record saved");
        self.coordinator
            .publish(WatchEventKind::Put, kind.key(id), Some(json));
        Ok(())
    }

    async fn remove(&self, kind: EntityKind, id: &str) -> StoreResult<()> {
        self.ensure_open()?;
        let path = self
            .record_path(kind, id)
            .ok_or_else(|| StoreError::not_found(kind, id))?;

        {
            let _guard = self.write_lock.lock().await;
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(StoreError::not_found(kind, id))
                }
                Err(e) => return Err(e.into()),
            }
        }

        debug!(kind = %kind, id = %id, "Record deleted");
        self.coordinator
            .publish(WatchEventKind::Delete, kind.key(id), None);
        Ok(())
    }

    async fn list<T: DeserializeOwned>(&self, kind: EntityKind) -> StoreResult<Vec<T>> {
        self.ensure_open()?;
        let dir = self.root.join(kind.collection());
        let mut entries = fs::read_dir(&dir).await?;
        let mut records = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let bytes = match fs::read(&path).await {
                Ok(bytes) => bytes,
                // Deleted between read_dir and read.
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            match serde_json::from_slice(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable record");
                }
            }
        }

        Ok(records)
    }
}

#[async_trait]
impl Store for FileStore {
    async fn get_node(&self, id: &NodeId) -> StoreResult<Node> {
        self.read(EntityKind::Node, id.as_str()).await
    }

    async fn list_nodes(&self) -> StoreResult<Vec<Node>> {
        let mut nodes: Vec<Node> = self.list(EntityKind::Node).await?;
        nodes.sort_by(|a, b| a.joined_at.cmp(&b.joined_at));
        Ok(nodes)
    }

    async fn save_node(&self, node: &Node) -> StoreResult<()> {
        self.write(EntityKind::Node, node.id.as_str(), node).await
    }

    async fn delete_node(&self, id: &NodeId) -> StoreResult<()> {
        self.remove(EntityKind::Node, id.as_str()).await
    }

    async fn get_agent(&self, id: &AgentId) -> StoreResult<Agent> {
        self.read(EntityKind::Agent, id.as_str()).await
    }

    async fn list_agents(&self) -> StoreResult<Vec<Agent>> {
        let mut agents: Vec<Agent> = self.list(EntityKind::Agent).await?;
        agents.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(agents)
    }

    async fn save_agent(&self, agent: &Agent) -> StoreResult<()> {
        self.write(EntityKind::Agent, agent.id.as_str(), agent).await
    }

    async fn delete_agent(&self, id: &AgentId) -> StoreResult<()> {
        self.remove(EntityKind::Agent, id.as_str()).await
    }

    async fn get_task(&self, id: &TaskId) -> StoreResult<Task> {
        self.read(EntityKind::Task, id.as_str()).await
    }

    async fn list_tasks(&self) -> StoreResult<Vec<Task>> {
        let mut tasks: Vec<Task> = self.list(EntityKind::Task).await?;
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    async fn save_task(&self, task: &Task) -> StoreResult<()> {
        self.write(EntityKind::Task, task.id.as_str(), task).await
    }

    async fn delete_task(&self, id: &TaskId) -> StoreResult<()> {
        self.remove(EntityKind::Task, id.as_str()).await
    }

    async fn close(&self) -> StoreResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(data_dir = %self.root.display(), "File store closed");
        }
        Ok(())
    }

    fn coordination(&self) -> Option<&dyn CoordinationCapable> {
        Some(&self.coordinator)
    }
}
