//! NodeService implementation: registration, dispatch and task delivery.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, error, info, warn};

use agentfleet_core::{AgentId, NodeId, NodeRegistration, TaskId, TaskResult};
use agentfleet_proto::pb::task_message::Payload;
use agentfleet_proto::pb::{
    self, DeregisterAgentRequest, DeregisterAgentResponse, DeregisterRequest, DeregisterResponse,
    DispatchTaskRequest, DispatchTaskResponse, GetTaskStatusRequest, HeartbeatRequest,
    HeartbeatResponse, ListAgentsRequest, ListAgentsResponse, ListNodesRequest, ListNodesResponse,
    ListTasksRequest, ListTasksResponse, RegisterAgentRequest, RegisterAgentResponse,
    RegisterRequest, RegisterResponse, TaskMessage,
};
use agentfleet_proto::{NodeService, NodeServiceServer, MAX_FRAME_LEN};

use crate::controller::{Controller, DispatchRequest, TaskFilter};

/// Empty proto strings mean "not provided".
fn non_empty(value: &str) -> Option<&str> {
    (!value.is_empty()).then_some(value)
}

fn required(value: String, field: &str) -> Result<String, Status> {
    if value.is_empty() {
        Err(Status::invalid_argument(format!("{field} is required")))
    } else {
        Ok(value)
    }
}

/// gRPC NodeService implementation.
pub struct NodeServiceImpl {
    controller: Arc<Controller>,
}

impl NodeServiceImpl {
    pub fn new(controller: Arc<Controller>) -> Self {
        Self { controller }
    }

    /// Convert into a tonic server.
    /// Inbound messages share the framed transport's size limit.
    pub fn into_server(self) -> NodeServiceServer<Self> {
        NodeServiceServer::new(self).max_decoding_message_size(MAX_FRAME_LEN)
    }
}

#[tonic::async_trait]
impl NodeService for NodeServiceImpl {
    type TaskStreamStream = Pin<Box<dyn Stream<Item = Result<TaskMessage, Status>> + Send>>;

    async fn register(
        &self,
        request: Request<RegisterRequest>,
    ) -> Result<Response<RegisterResponse>, Status> {
        let req = request.into_inner();
        self.controller.authorize(non_empty(&req.token))?;

        let registration = NodeRegistration::from(req);
        let node_id = self.controller.register_node(registration).await?;

        Ok(Response::new(RegisterResponse {
            node_id: node_id.into_inner(),
        }))
    }

    async fn heartbeat(
        &self,
        request: Request<HeartbeatRequest>,
    ) -> Result<Response<HeartbeatResponse>, Status> {
        let node_id = NodeId::new(required(request.into_inner().node_id, "node_id")?);
        let last_seen = self.controller.heartbeat(&node_id).await?;

        Ok(Response::new(HeartbeatResponse {
            last_seen_ms: last_seen.timestamp_millis(),
        }))
    }

    async fn deregister(
        &self,
        request: Request<DeregisterRequest>,
    ) -> Result<Response<DeregisterResponse>, Status> {
        let node_id = NodeId::new(required(request.into_inner().node_id, "node_id")?);
        self.controller.deregister_node(&node_id).await?;
        Ok(Response::new(DeregisterResponse {}))
    }

    async fn register_agent(
        &self,
        request: Request<RegisterAgentRequest>,
    ) -> Result<Response<RegisterAgentResponse>, Status> {
        let req = request.into_inner();
        let spec = req.spec();
        let node_id = NodeId::new(required(req.node_id, "node_id")?);

        let agent_id = self.controller.register_agent(&node_id, spec).await?;

        Ok(Response::new(RegisterAgentResponse {
            agent_id: agent_id.into_inner(),
        }))
    }

    async fn deregister_agent(
        &self,
        request: Request<DeregisterAgentRequest>,
    ) -> Result<Response<DeregisterAgentResponse>, Status> {
        let req = request.into_inner();
        let node_id = NodeId::new(required(req.node_id, "node_id")?);
        let agent_id = AgentId::new(required(req.agent_id, "agent_id")?);

        self.controller.deregister_agent(&node_id, &agent_id).await?;
        Ok(Response::new(DeregisterAgentResponse {}))
    }

    async fn dispatch_task(
        &self,
        request: Request<DispatchTaskRequest>,
    ) -> Result<Response<DispatchTaskResponse>, Status> {
        let req = request.into_inner();
        self.controller.authorize(non_empty(&req.token))?;

        let mut dispatch = DispatchRequest::new(req.agent_name, req.prompt)
            .with_metadata(req.metadata)
            .with_priority(req.priority)
            .with_type(req.task_type);
        if req.wait {
            let timeout = (req.timeout_seconds > 0)
                .then(|| Duration::from_secs(u64::from(req.timeout_seconds)));
            dispatch = dispatch.wait_for(timeout);
        }

        let outcome = self.controller.dispatch(dispatch).await?;

        Ok(Response::new(DispatchTaskResponse {
            task_id: outcome.task_id.into_inner(),
            status: pb::TaskStatus::from(outcome.status) as i32,
            result: outcome.result,
            error: outcome.error.unwrap_or_default(),
        }))
    }

    async fn get_task_status(
        &self,
        request: Request<GetTaskStatusRequest>,
    ) -> Result<Response<pb::Task>, Status> {
        let task_id = TaskId::new(required(request.into_inner().task_id, "task_id")?);
        let task = self.controller.get_task(&task_id).await?;
        Ok(Response::new(task.into()))
    }

    async fn list_nodes(
        &self,
        _request: Request<ListNodesRequest>,
    ) -> Result<Response<ListNodesResponse>, Status> {
        let nodes = self.controller.list_nodes().await?;
        Ok(Response::new(ListNodesResponse {
            nodes: nodes.into_iter().map(Into::into).collect(),
        }))
    }

    async fn list_agents(
        &self,
        request: Request<ListAgentsRequest>,
    ) -> Result<Response<ListAgentsResponse>, Status> {
        let node_id = request
            .into_inner()
            .node_id
            .filter(|id| !id.is_empty())
            .map(NodeId::new);
        let agents = self.controller.list_agents(node_id.as_ref()).await?;
        Ok(Response::new(ListAgentsResponse {
            agents: agents.into_iter().map(Into::into).collect(),
        }))
    }

    async fn list_tasks(
        &self,
        request: Request<ListTasksRequest>,
    ) -> Result<Response<ListTasksResponse>, Status> {
        let req = request.into_inner();
        let filter = TaskFilter {
            status: req.status_filter().to_domain(),
            agent_name: non_empty(&req.agent_filter).map(str::to_string),
            limit: req.limit as usize,
        };

        let tasks = self.controller.list_tasks(&filter).await?;
        Ok(Response::new(ListTasksResponse {
            tasks: tasks.into_iter().map(Into::into).collect(),
        }))
    }

    async fn task_stream(
        &self,
        request: Request<Streaming<TaskMessage>>,
    ) -> Result<Response<Self::TaskStreamStream>, Status> {
        let mut inbound = request.into_inner();

        let node_id = match inbound.message().await?.and_then(|m| m.payload) {
            Some(Payload::Connect(connect)) => NodeId::new(required(connect.node_id, "node_id")?),
            _ => {
                return Err(Status::failed_precondition(
                    "first task stream message must be connect",
                ))
            }
        };

        let tasks = self.controller.attach(&node_id)?;
        info!(node_id = %node_id, "Task stream connected");

        let controller = self.controller.clone();
        let stream_node = node_id.clone();
        tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(msg)) => handle_stream_message(&controller, &stream_node, msg).await,
                    Ok(None) => {
                        info!(node_id = %stream_node, "Task stream closed by node");
                        break;
                    }
                    Err(status) => {
                        warn!(node_id = %stream_node, error = %status, "Task stream error");
                        break;
                    }
                }
            }

            if let Err(e) = controller.disconnect(&stream_node).await {
                error!(node_id = %stream_node, error = %e, "Failed to record disconnect");
            }
        });

        let outbound = ReceiverStream::new(tasks).map(move |assignment| {
            debug!(node_id = %node_id, task_id = %assignment.task_id, "Sending task");
            Ok(TaskMessage::task(assignment))
        });
        Ok(Response::new(Box::pin(outbound)))
    }
}

async fn handle_stream_message(controller: &Controller, node_id: &NodeId, msg: TaskMessage) {
    match msg.payload {
        Some(Payload::Result(result)) => {
            let result = TaskResult::from(result);
            if let Err(e) = controller.report_result(node_id, result).await {
                warn!(node_id = %node_id, error = %e, "Failed to record task result");
            }
        }
        Some(Payload::Progress(progress)) => {
            let Some(status) = progress.status().to_domain() else {
                debug!(node_id = %node_id, "Progress without status");
                return;
            };
            let task_id = TaskId::new(progress.task_id);
            if let Err(e) = controller.report_progress(node_id, &task_id, status).await {
                warn!(node_id = %node_id, task_id = %task_id, error = %e, "Failed to record task progress");
            }
        }
        Some(Payload::Heartbeat(_)) => {
            if let Err(e) = controller.heartbeat(node_id).await {
                warn!(node_id = %node_id, error = %e, "Stream heartbeat rejected");
            }
        }
        Some(Payload::Connect(_)) => {
            warn!(node_id = %node_id, "Ignoring repeated connect");
        }
        Some(Payload::Task(_)) | None => {
            debug!(node_id = %node_id, "Ignoring unexpected task stream message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControllerSettings;
    use agentfleet_store::MemoryStore;
    use tokio_util::sync::CancellationToken;
    use tonic::Code;

    fn service(token: Option<&str>) -> NodeServiceImpl {
        let controller = Controller::new(
            Arc::new(MemoryStore::new()),
            ControllerSettings {
                token: token.map(str::to_string),
                ..Default::default()
            },
            CancellationToken::new(),
        );
        NodeServiceImpl::new(Arc::new(controller))
    }

    fn register_request(token: &str) -> RegisterRequest {
        RegisterRequest {
            token: token.to_string(),
            node_name: "worker-1".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_register_requires_token() {
        let service = service(Some("secret"));

        let status = service
            .register(Request::new(register_request("")))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Unauthenticated);

        let response = service
            .register(Request::new(register_request("secret")))
            .await
            .unwrap()
            .into_inner();
        assert!(!response.node_id.is_empty());
    }

    #[tokio::test]
    async fn test_agent_on_unattached_node_is_not_found() {
        let service = service(None);
        let node_id = service
            .register(Request::new(register_request("")))
            .await
            .unwrap()
            .into_inner()
            .node_id;

        service
            .register_agent(Request::new(RegisterAgentRequest {
                node_id: node_id.clone(),
                name: "coder".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap();

        let status = service
            .dispatch_task(Request::new(DispatchTaskRequest {
                agent_name: "coder".to_string(),
                prompt: "hi".to_string(),
                wait: true,
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::NotFound);

        let agents = service
            .list_agents(Request::new(ListAgentsRequest {
                node_id: Some(node_id),
            }))
            .await
            .unwrap()
            .into_inner()
            .agents;
        assert_eq!(agents.len(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_node() {
        let service = service(None);
        let status = service
            .heartbeat(Request::new(HeartbeatRequest {
                node_id: "ghost".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::FailedPrecondition);

        let status = service
            .heartbeat(Request::new(HeartbeatRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
    }
}
