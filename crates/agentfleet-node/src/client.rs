//! Transport-independent node client surface.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use agentfleet_core::{AgentId, AgentSpec, NodeId};

use crate::config::{Config, Transport};
use crate::error::ClientError;
use crate::framed::FramedNodeClient;
use crate::grpc::GrpcNodeClient;
use crate::runner::AgentRunner;

/// A registered node connection.
///
/// Obtained from the transport's `connect`, which registers the node and
/// keeps the assigned id. Agents can be registered before or after
/// [`start`](NodeClient::start); tasks are only executed once started.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Id assigned by the controller.
    fn node_id(&self) -> &NodeId;

    /// Advertise an agent hosted by this node.
    async fn register_agent(&self, spec: AgentSpec) -> Result<AgentId, ClientError>;

    async fn deregister_agent(&self, agent_id: &AgentId) -> Result<(), ClientError>;

    /// Start the heartbeat loop and execute incoming tasks with `runner`.
    fn start(&mut self, runner: Arc<dyn AgentRunner>) -> Result<(), ClientError>;

    /// Fires when the client stops, whether by [`stop`](NodeClient::stop),
    /// a failed heartbeat or a lost connection.
    fn stopped(&self) -> CancellationToken;

    /// Cancel background tasks and close the connection.
    async fn stop(&mut self) -> Result<(), ClientError>;
}

/// Connect with the transport named in `config`.
pub async fn connect(config: &Config) -> Result<Box<dyn NodeClient>, ClientError> {
    match config.transport {
        Transport::Framed => Ok(Box::new(FramedNodeClient::connect(config).await?)),
        Transport::Grpc => Ok(Box::new(GrpcNodeClient::connect(config).await?)),
    }
}
