//! Converters between proto types and domain types.

use chrono::{DateTime, Utc};

use crate::pb;
use agentfleet_core::{
    Agent, AgentSpec, Node, NodeRegistration, NodeStatus, Task, TaskAssignment, TaskId,
    TaskResult, TaskStatus,
};

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

// ============================================================================
// NodeStatus conversions
// ============================================================================

impl From<NodeStatus> for pb::NodeStatus {
    fn from(status: NodeStatus) -> Self {
        match status {
            NodeStatus::Ready => pb::NodeStatus::Ready,
            NodeStatus::NotReady => pb::NodeStatus::NotReady,
            NodeStatus::Disconnected => pb::NodeStatus::Disconnected,
        }
    }
}

// ============================================================================
// TaskStatus conversions
// ============================================================================

impl From<TaskStatus> for pb::TaskStatus {
    fn from(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Pending => pb::TaskStatus::Pending,
            TaskStatus::Dispatched => pb::TaskStatus::Dispatched,
            TaskStatus::Running => pb::TaskStatus::Running,
            TaskStatus::Completed => pb::TaskStatus::Completed,
            TaskStatus::Failed => pb::TaskStatus::Failed,
            TaskStatus::Timeout => pb::TaskStatus::Timeout,
        }
    }
}

impl pb::TaskStatus {
    /// Domain status, or `None` for `UNSPECIFIED`.
    pub fn to_domain(self) -> Option<TaskStatus> {
        match self {
            pb::TaskStatus::Unspecified => None,
            pb::TaskStatus::Pending => Some(TaskStatus::Pending),
            pb::TaskStatus::Dispatched => Some(TaskStatus::Dispatched),
            pb::TaskStatus::Running => Some(TaskStatus::Running),
            pb::TaskStatus::Completed => Some(TaskStatus::Completed),
            pb::TaskStatus::Failed => Some(TaskStatus::Failed),
            pb::TaskStatus::Timeout => Some(TaskStatus::Timeout),
        }
    }
}

// ============================================================================
// Record conversions (controller -> caller)
// ============================================================================

impl From<Node> for pb::Node {
    fn from(node: Node) -> Self {
        pb::Node {
            id: node.id.into_inner(),
            name: node.name,
            address: node.address,
            labels: node.labels,
            status: pb::NodeStatus::from(node.status) as i32,
            version: node.version,
            joined_at_ms: millis(node.joined_at),
            last_seen_ms: millis(node.last_seen),
            agent_ids: node.agent_ids.into_iter().map(|id| id.into_inner()).collect(),
        }
    }
}

impl From<Agent> for pb::Agent {
    fn from(agent: Agent) -> Self {
        pb::Agent {
            id: agent.id.into_inner(),
            name: agent.name,
            node_id: agent.node_id.into_inner(),
            cluster: agent.cluster,
            namespace: agent.namespace,
            description: agent.description,
            model: agent.model,
            skills: agent.skills,
            status: agent.status.as_str().to_string(),
            created_at_ms: millis(agent.created_at),
            last_active_ms: millis(agent.last_active),
        }
    }
}

impl From<Task> for pb::Task {
    fn from(task: Task) -> Self {
        pb::Task {
            id: task.id.into_inner(),
            task_type: task.task_type,
            agent_id: task.agent_id.into_inner(),
            agent_name: task.agent_name,
            node_id: task.node_id.into_inner(),
            prompt: task.prompt,
            priority: task.priority,
            status: pb::TaskStatus::from(task.status) as i32,
            result: task.result,
            error: task.error.unwrap_or_default(),
            metadata: task.metadata,
            created_at_ms: millis(task.created_at),
            started_at_ms: task.started_at.map(millis),
            finished_at_ms: task.finished_at.map(millis),
        }
    }
}

// ============================================================================
// Registration conversions (node -> controller)
// ============================================================================

impl From<NodeRegistration> for pb::RegisterRequest {
    fn from(reg: NodeRegistration) -> Self {
        pb::RegisterRequest {
            token: String::new(),
            node_name: reg.name,
            address: reg.address,
            labels: reg.labels,
            version: reg.version,
        }
    }
}

impl From<pb::RegisterRequest> for NodeRegistration {
    fn from(req: pb::RegisterRequest) -> Self {
        NodeRegistration {
            name: req.node_name,
            address: req.address,
            labels: req.labels,
            version: req.version,
        }
    }
}

impl pb::RegisterAgentRequest {
    /// Build a request for `node_id` from an agent spec.
    pub fn from_spec(node_id: impl Into<String>, spec: AgentSpec) -> Self {
        pb::RegisterAgentRequest {
            node_id: node_id.into(),
            name: spec.name,
            cluster: spec.cluster,
            namespace: spec.namespace,
            description: spec.description,
            model: spec.model,
            skills: spec.skills,
        }
    }

    /// The agent spec carried by this request.
    pub fn spec(&self) -> AgentSpec {
        AgentSpec {
            name: self.name.clone(),
            cluster: self.cluster.clone(),
            namespace: self.namespace.clone(),
            description: self.description.clone(),
            model: self.model.clone(),
            skills: self.skills.clone(),
        }
    }
}

// ============================================================================
// Task stream conversions
// ============================================================================

impl From<TaskAssignment> for pb::TaskAssignment {
    fn from(assignment: TaskAssignment) -> Self {
        pb::TaskAssignment {
            task_id: assignment.task_id.into_inner(),
            agent_name: assignment.agent_name,
            prompt: assignment.prompt,
            metadata: assignment.metadata,
        }
    }
}

impl From<pb::TaskAssignment> for TaskAssignment {
    fn from(proto: pb::TaskAssignment) -> Self {
        TaskAssignment {
            task_id: TaskId::new(proto.task_id),
            agent_name: proto.agent_name,
            prompt: proto.prompt,
            metadata: proto.metadata,
        }
    }
}

impl From<TaskResult> for pb::TaskResult {
    fn from(result: TaskResult) -> Self {
        pb::TaskResult {
            task_id: result.task_id.into_inner(),
            result: result.result,
            error: result.error.unwrap_or_default(),
        }
    }
}

impl From<pb::TaskResult> for TaskResult {
    fn from(proto: pb::TaskResult) -> Self {
        TaskResult::from_parts(TaskId::new(proto.task_id), proto.result, Some(proto.error))
    }
}

impl pb::TaskMessage {
    pub fn connect(node_id: impl Into<String>) -> Self {
        pb::TaskMessage {
            payload: Some(pb::task_message::Payload::Connect(pb::Connect {
                node_id: node_id.into(),
            })),
        }
    }

    pub fn task(assignment: TaskAssignment) -> Self {
        pb::TaskMessage {
            payload: Some(pb::task_message::Payload::Task(assignment.into())),
        }
    }

    pub fn result(result: TaskResult) -> Self {
        pb::TaskMessage {
            payload: Some(pb::task_message::Payload::Result(result.into())),
        }
    }

    pub fn progress(task_id: &TaskId, status: TaskStatus) -> Self {
        pb::TaskMessage {
            payload: Some(pb::task_message::Payload::Progress(pb::TaskProgress {
                task_id: task_id.to_string(),
                status: pb::TaskStatus::from(status) as i32,
                message: String::new(),
            })),
        }
    }
}
