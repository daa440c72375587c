//! Controller errors and their gRPC mapping.

use thiserror::Error;
use tonic::Status;

use agentfleet_core::{NodeId, TaskId};
use agentfleet_store::StoreError;

/// Errors surfaced by the controller core to either transport.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Bearer token missing or different from the configured one.
    #[error("unauthorized: invalid token")]
    Unauthorized,

    /// No agent with this name on an attached node.
    #[error("agent not found or no connected node running it")]
    AgentUnavailable(String),

    #[error("node not connected: {0}")]
    NodeNotConnected(NodeId),

    #[error("node {0} already has an attached task stream")]
    AlreadyAttached(NodeId),

    /// The node's queue stayed full for the whole enqueue timeout.
    #[error("task queue full for node {0}")]
    QueueFull(NodeId),

    /// A node reported on a task that was dispatched to another node.
    #[error("task {task_id} is not assigned to node {node_id}")]
    WrongNode { task_id: TaskId, node_id: NodeId },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("controller is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type ControllerResult<T> = Result<T, ControllerError>;

impl From<ControllerError> for Status {
    fn from(err: ControllerError) -> Self {
        let message = err.to_string();
        match err {
            ControllerError::Unauthorized => Status::unauthenticated(message),
            ControllerError::AgentUnavailable(_) => Status::not_found(message),
            ControllerError::NodeNotConnected(_) => Status::failed_precondition(message),
            ControllerError::AlreadyAttached(_) => Status::already_exists(message),
            ControllerError::QueueFull(_) => Status::resource_exhausted(message),
            ControllerError::WrongNode { .. } => Status::permission_denied(message),
            ControllerError::InvalidArgument(_) => Status::invalid_argument(message),
            ControllerError::ShuttingDown => Status::unavailable(message),
            ControllerError::Store(StoreError::NotFound { .. }) => Status::not_found(message),
            ControllerError::Store(_) => Status::internal(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentfleet_store::EntityKind;
    use tonic::Code;

    #[test]
    fn test_status_mapping() {
        let status: Status = ControllerError::Unauthorized.into();
        assert_eq!(status.code(), Code::Unauthenticated);

        let status: Status =
            ControllerError::Store(StoreError::not_found(EntityKind::Task, "t1")).into();
        assert_eq!(status.code(), Code::NotFound);
        assert_eq!(status.message(), "task not found: t1");

        let status: Status = ControllerError::AgentUnavailable("coder".into()).into();
        assert_eq!(status.code(), Code::NotFound);
        assert_eq!(
            status.message(),
            "agent not found or no connected node running it"
        );
    }
}
