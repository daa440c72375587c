//! Node client over gRPC.
//!
//! Registration, heartbeats and agent changes are unary calls; tasks arrive
//! on the bidirectional `TaskStream`, which the client opens with a
//! `Connect` message naming its node id.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::Streaming;
use tracing::{debug, info, warn};

use agentfleet_core::{AgentId, AgentSpec, NodeId, TaskAssignment, TaskStatus};
use agentfleet_proto::pb::task_message::Payload;
use agentfleet_proto::pb::{
    DeregisterAgentRequest, DeregisterRequest, HeartbeatRequest, RegisterAgentRequest,
    RegisterRequest, TaskMessage,
};
use agentfleet_proto::{NodeServiceClient, MAX_FRAME_LEN};

use crate::client::NodeClient;
use crate::config::Config;
use crate::error::ClientError;
use crate::executor::{spawn_dispatcher, ExecutionEvent, EVENT_BUFFER};
use crate::heartbeat::run_heartbeat_loop;
use crate::runner::AgentRunner;
use crate::state::save_node_id;

/// Messages buffered for the outbound half of the task stream.
const OUTBOUND_BUFFER: usize = 32;

/// Assignments buffered between the stream reader and the dispatcher.
const ASSIGNMENT_BUFFER: usize = 100;

/// Add a scheme to bare `host:port` addresses.
fn endpoint_url(addr: &str) -> String {
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    }
}

/// Node client speaking gRPC.
pub struct GrpcNodeClient {
    node_id: NodeId,
    client: NodeServiceClient<Channel>,
    outbound: Option<mpsc::Sender<TaskMessage>>,
    assignments: Option<mpsc::Receiver<TaskAssignment>>,
    heartbeat_interval: Duration,
    stopped: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl GrpcNodeClient {
    /// Dial the controller, register and open the task stream.
    pub async fn connect(config: &Config) -> Result<Self, ClientError> {
        let url = endpoint_url(&config.controller_addr);
        info!(addr = %url, "Connecting to control plane");

        let channel = Channel::from_shared(url.clone())
            .map_err(|_| ClientError::InvalidAddress(url))?
            .connect()
            .await?;
        let mut client = NodeServiceClient::new(channel).max_encoding_message_size(MAX_FRAME_LEN);

        let mut request = RegisterRequest::from(config.registration());
        request.token = config.token.clone().unwrap_or_default();
        let node_id = NodeId::new(client.register(request).await?.into_inner().node_id);
        info!(node_id = %node_id, "Registered with control plane");

        if let Some(path) = &config.state_file {
            if let Err(e) = save_node_id(path, &node_id).await {
                warn!(path = %path.display(), error = %e, "Failed to write node id state file");
            }
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        outbound_tx
            .send(TaskMessage::connect(node_id.as_str()))
            .await
            .map_err(|_| ClientError::Closed)?;
        let inbound = client
            .task_stream(ReceiverStream::new(outbound_rx))
            .await?
            .into_inner();
        debug!(node_id = %node_id, "Task stream open");

        let stopped = CancellationToken::new();
        let (assign_tx, assign_rx) = mpsc::channel(ASSIGNMENT_BUFFER);
        let reader_task = tokio::spawn(read_loop(inbound, assign_tx, stopped.clone()));

        Ok(Self {
            node_id,
            client,
            outbound: Some(outbound_tx),
            assignments: Some(assign_rx),
            heartbeat_interval: config.heartbeat_interval,
            stopped,
            tasks: vec![reader_task],
        })
    }
}

#[async_trait]
impl NodeClient for GrpcNodeClient {
    fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    async fn register_agent(&self, spec: AgentSpec) -> Result<AgentId, ClientError> {
        let name = spec.name.clone();
        let request = RegisterAgentRequest::from_spec(self.node_id.as_str(), spec);
        let response = self.client.clone().register_agent(request).await?;
        let agent_id = AgentId::new(response.into_inner().agent_id);

        info!(agent_id = %agent_id, agent = %name, "Agent registered");
        Ok(agent_id)
    }

    async fn deregister_agent(&self, agent_id: &AgentId) -> Result<(), ClientError> {
        let request = DeregisterAgentRequest {
            node_id: self.node_id.to_string(),
            agent_id: agent_id.to_string(),
        };
        self.client.clone().deregister_agent(request).await?;
        Ok(())
    }

    fn start(&mut self, runner: Arc<dyn AgentRunner>) -> Result<(), ClientError> {
        let assignments = self.assignments.take().ok_or(ClientError::AlreadyStarted)?;
        let outbound = self.outbound.clone().ok_or(ClientError::Closed)?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        self.tasks.push(spawn_dispatcher(
            runner,
            assignments,
            events_tx,
            self.stopped.clone(),
        ));
        self.tasks.push(tokio::spawn(forward_events(
            outbound,
            events_rx,
            self.stopped.clone(),
        )));

        let client = self.client.clone();
        let node_id = self.node_id.clone();
        self.tasks.push(tokio::spawn(run_heartbeat_loop(
            self.heartbeat_interval,
            self.stopped.clone(),
            move || {
                let mut client = client.clone();
                let request = HeartbeatRequest {
                    node_id: node_id.to_string(),
                };
                async move {
                    client.heartbeat(request).await?;
                    Ok(())
                }
            },
        )));

        info!(node_id = %self.node_id, "Node client started");
        Ok(())
    }

    fn stopped(&self) -> CancellationToken {
        self.stopped.clone()
    }

    async fn stop(&mut self) -> Result<(), ClientError> {
        let deregistered = if self.stopped.is_cancelled() {
            Ok(())
        } else {
            let request = DeregisterRequest {
                node_id: self.node_id.to_string(),
            };
            self.client.deregister(request).await.map(|_| ())
        };

        self.stopped.cancel();
        // Closing the outbound half ends the task stream.
        self.outbound = None;

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task panicked");
            }
        }

        info!(node_id = %self.node_id, "Node client stopped");
        deregistered.map_err(Into::into)
    }
}

impl Drop for GrpcNodeClient {
    fn drop(&mut self) {
        self.stopped.cancel();
    }
}

async fn read_loop(
    mut inbound: Streaming<TaskMessage>,
    assignments: mpsc::Sender<TaskAssignment>,
    stopped: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            message = inbound.next() => message,
            _ = stopped.cancelled() => break,
        };

        match message {
            Some(Ok(TaskMessage {
                payload: Some(Payload::Task(task)),
            })) => {
                let assignment = TaskAssignment::from(task);
                debug!(task_id = %assignment.task_id, agent = %assignment.agent_name, "Received task");
                if assignments.send(assignment).await.is_err() {
                    break;
                }
            }
            Some(Ok(_)) => debug!("Ignoring non-task message"),
            Some(Err(status)) => {
                warn!(error = %status, "Task stream error");
                break;
            }
            None => {
                info!("Control plane closed the task stream");
                break;
            }
        }
    }

    stopped.cancel();
}

async fn forward_events(
    outbound: mpsc::Sender<TaskMessage>,
    mut events: mpsc::Receiver<ExecutionEvent>,
    stopped: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = stopped.cancelled() => break,
        };

        let message = match event {
            ExecutionEvent::Started(task_id) => TaskMessage::progress(&task_id, TaskStatus::Running),
            ExecutionEvent::Finished(result) => TaskMessage::result(result),
        };
        if outbound.send(message).await.is_err() {
            warn!("Task stream closed, stopping client");
            stopped.cancel();
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_url() {
        assert_eq!(endpoint_url("127.0.0.1:7401"), "http://127.0.0.1:7401");
        assert_eq!(endpoint_url("https://cp.example:443"), "https://cp.example:443");
    }
}
