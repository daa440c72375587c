//! Newline-delimited JSON frame protocol.
//!
//! Every message is one JSON object on its own line, discriminated by its
//! `type` field:
//!
//! ```text
//! {"type":"register","node_name":"worker-1","version":"0.1.0"}
//! {"type":"registered","node_id":"3f9a1c2e"}
//! ```
//!
//! The first frame on a connection decides its role: `register` opens a node
//! session, `dispatch` makes it a one-shot dispatch client.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use agentfleet_core::{AgentId, AgentSpec, NodeId, NodeRegistration, TaskAssignment, TaskId, TaskResult, TaskStatus};

/// Largest accepted frame, newline included. The gRPC transport uses the
/// same limit per message.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Largest prompt or task output carried by either transport. Leaves room
/// for the envelope and JSON escaping within [`MAX_FRAME_LEN`].
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN / 2;

/// Framed protocol errors.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed frame: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Frame is not valid UTF-8")]
    InvalidUtf8,

    #[error("Frame exceeds {MAX_FRAME_LEN} bytes")]
    TooLarge,
}

impl FrameError {
    /// The frame was unreadable but the stream is still positioned at the
    /// next line, so a session can carry on.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FrameError::Decode(_) | FrameError::InvalidUtf8)
    }
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    // ---- node -> controller ----
    Register {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        node_name: String,
        #[serde(default)]
        address: String,
        #[serde(default)]
        labels: HashMap<String, String>,
        #[serde(default)]
        version: String,
    },
    Heartbeat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node_id: Option<NodeId>,
    },
    RegisterAgent {
        agent_name: String,
        #[serde(default)]
        cluster: String,
        #[serde(default)]
        namespace: String,
        #[serde(default)]
        description: String,
        #[serde(default)]
        model: String,
        #[serde(default)]
        skills: Vec<String>,
    },
    DeregisterAgent {
        agent_id: AgentId,
    },
    TaskResult {
        task_id: TaskId,
        #[serde(default)]
        result: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    // ---- dispatch client -> controller ----
    Dispatch {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        agent: String,
        prompt: String,
        #[serde(default)]
        metadata: HashMap<String, String>,
        #[serde(default)]
        priority: i32,
    },

    // ---- controller -> node ----
    Registered {
        node_id: NodeId,
    },
    HeartbeatAck,
    AgentRegistered {
        agent_id: AgentId,
    },
    AgentDeregistered {
        agent_id: AgentId,
    },
    Task {
        task_id: TaskId,
        agent_name: String,
        prompt: String,
        #[serde(default)]
        metadata: HashMap<String, String>,
    },

    // ---- controller -> dispatch client (and node -> controller progress) ----
    TaskCreated {
        task_id: TaskId,
    },
    TaskProgress {
        task_id: TaskId,
        status: TaskStatus,
    },
    TaskCompleted {
        task_id: TaskId,
        result: String,
    },
    TaskFailed {
        task_id: TaskId,
        error: String,
    },

    Error {
        error: String,
    },
}

impl Frame {
    /// Wire name of the frame type.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Register { .. } => "register",
            Frame::Heartbeat { .. } => "heartbeat",
            Frame::RegisterAgent { .. } => "register_agent",
            Frame::DeregisterAgent { .. } => "deregister_agent",
            Frame::TaskResult { .. } => "task_result",
            Frame::Dispatch { .. } => "dispatch",
            Frame::Registered { .. } => "registered",
            Frame::HeartbeatAck => "heartbeat_ack",
            Frame::AgentRegistered { .. } => "agent_registered",
            Frame::AgentDeregistered { .. } => "agent_deregistered",
            Frame::Task { .. } => "task",
            Frame::TaskCreated { .. } => "task_created",
            Frame::TaskProgress { .. } => "task_progress",
            Frame::TaskCompleted { .. } => "task_completed",
            Frame::TaskFailed { .. } => "task_failed",
            Frame::Error { .. } => "error",
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Frame::Error {
            error: message.into(),
        }
    }

    pub fn register(registration: NodeRegistration, token: Option<String>) -> Self {
        Frame::Register {
            token,
            node_name: registration.name,
            address: registration.address,
            labels: registration.labels,
            version: registration.version,
        }
    }

    pub fn register_agent(spec: AgentSpec) -> Self {
        Frame::RegisterAgent {
            agent_name: spec.name,
            cluster: spec.cluster,
            namespace: spec.namespace,
            description: spec.description,
            model: spec.model,
            skills: spec.skills,
        }
    }

    pub fn task(assignment: TaskAssignment) -> Self {
        Frame::Task {
            task_id: assignment.task_id,
            agent_name: assignment.agent_name,
            prompt: assignment.prompt,
            metadata: assignment.metadata,
        }
    }

    pub fn task_result(result: TaskResult) -> Self {
        Frame::TaskResult {
            task_id: result.task_id,
            result: result.result,
            error: result.error,
        }
    }
}

/// Reads frames from a buffered byte stream.
pub struct FrameReader<R> {
    inner: R,
    line: String,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            line: String::new(),
        }
    }

    /// Next frame, or `None` at end of stream. Blank lines are skipped.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        loop {
            self.line.clear();
            let read = match (&mut self.inner)
                .take(MAX_FRAME_LEN as u64 + 1)
                .read_line(&mut self.line)
                .await
            {
                Ok(read) => read,
                // The whole line has been consumed, so the stream stays in step.
                Err(e) if e.kind() == std::io::ErrorKind::InvalidData => return Err(FrameError::InvalidUtf8),
                Err(e) => return Err(e.into()),
            };

            if read == 0 {
                return Ok(None);
            }
            if read > MAX_FRAME_LEN || (read == MAX_FRAME_LEN && !self.line.ends_with('\n')) {
                return Err(FrameError::TooLarge);
            }

            let trimmed = self.line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return Ok(Some(serde_json::from_str(trimmed)?));
        }
    }
}

/// Write one frame followed by a newline and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<(), FrameError> {
    let mut bytes = serde_json::to_vec(frame)?;
    bytes.push(b'\n');
    if bytes.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge);
    }
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}
