//! Transport-neutral messages exchanged between controller and node.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::TaskId;

/// A task as delivered to a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_id: TaskId,
    pub agent_name: String,
    pub prompt: String,
    pub metadata: HashMap<String, String>,
}

/// A node's report for a task it executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub result: String,

    /// Set when the runner failed; the task is then recorded as failed.
    pub error: Option<String>,
}

impl TaskResult {
    /// A successful execution.
    pub fn success(task_id: TaskId, output: impl Into<String>) -> Self {
        Self {
            task_id,
            result: output.into(),
            error: None,
        }
    }

    /// A failed execution.
    pub fn failure(task_id: TaskId, error: impl Into<String>) -> Self {
        Self {
            task_id,
            result: String::new(),
            error: Some(error.into()),
        }
    }

    /// Normalize a wire error field: empty strings mean "no error".
    pub fn from_parts(task_id: TaskId, result: String, error: Option<String>) -> Self {
        Self {
            task_id,
            result,
            error: error.filter(|e| !e.is_empty()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
