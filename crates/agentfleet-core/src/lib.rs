//! AgentFleet Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/gRPC
//! - Storage backends
//! - Runtime specifics
//!
//! Nodes, the agents they host, and the tasks dispatched to them are the
//! whole business domain of the control plane.

pub mod agent;
pub mod dispatch;
pub mod error;
pub mod ids;
pub mod node;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use agent::{Agent, AgentSpec};
pub use dispatch::{TaskAssignment, TaskResult};
pub use error::CoreError;
pub use ids::{AgentId, NodeId, TaskId};
pub use node::{Node, NodeRegistration};
pub use status::{AgentStatus, NodeStatus, TaskStatus};
pub use task::Task;
