//! Task records.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Agent, AgentId, NodeId, TaskAssignment, TaskId, TaskResult, TaskStatus};

/// Task type used when the caller does not name one.
pub const DEFAULT_TASK_TYPE: &str = "prompt";

/// One unit of dispatched work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,

    /// Free-form task kind.
    pub task_type: String,

    pub agent_id: AgentId,
    pub agent_name: String,

    /// Node the task was handed to. Fixed at dispatch time.
    pub node_id: NodeId,

    pub prompt: String,
    pub priority: i32,
    pub status: TaskStatus,

    /// Output reported by the node.
    pub result: String,

    /// Error reported by the node, or the reason the hand-off failed.
    pub error: Option<String>,

    /// Caller context (originating channel, etc.).
    pub metadata: HashMap<String, String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending task bound to `agent` and the node that hosts it.
    pub fn new(agent: &Agent, prompt: impl Into<String>) -> Self {
        Self {
            id: TaskId::generate(),
            task_type: DEFAULT_TASK_TYPE.to_string(),
            agent_id: agent.id.clone(),
            agent_name: agent.name.clone(),
            node_id: agent.node_id.clone(),
            prompt: prompt.into(),
            priority: 0,
            status: TaskStatus::Pending,
            result: String::new(),
            error: None,
            metadata: HashMap::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Builder method to set the task type. Empty keeps the default.
    pub fn with_type(mut self, task_type: impl Into<String>) -> Self {
        let task_type = task_type.into();
        if !task_type.is_empty() {
            self.task_type = task_type;
        }
        self
    }

    /// Builder method to set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Builder method to attach caller metadata.
    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata.extend(metadata);
        self
    }

    /// The message handed to the node for this task.
    pub fn assignment(&self) -> TaskAssignment {
        TaskAssignment {
            task_id: self.id.clone(),
            agent_name: self.agent_name.clone(),
            prompt: self.prompt.clone(),
            metadata: self.metadata.clone(),
        }
    }

    /// Mark the task as handed to its node.
    pub fn mark_dispatched(&mut self) {
        self.status = TaskStatus::Dispatched;
        self.started_at = Some(Utc::now());
    }

    /// Record the node's report: failed if it carried an error, completed otherwise.
    pub fn apply_result(&mut self, result: &TaskResult) {
        self.finished_at = Some(Utc::now());
        self.result = result.result.clone();
        match &result.error {
            Some(error) => {
                self.status = TaskStatus::Failed;
                self.error = Some(error.clone());
            }
            None => {
                self.status = TaskStatus::Completed;
                self.error = None;
            }
        }
    }

    /// Mark the task as failed without a node report.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.error = Some(error.into());
        self.finished_at = Some(Utc::now());
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
