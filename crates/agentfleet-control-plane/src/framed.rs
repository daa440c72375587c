//! Framed JSON transport.
//!
//! One TCP connection per node or per one-shot dispatch client. The first
//! frame decides which:
//! - `register` opens a node session: a reader loop handling session frames
//!   and a writer task that drains the node's task queue and the reply
//!   channel onto the socket.
//! - `dispatch` submits one task, then polls it and streams status frames
//!   until it finishes or the poll deadline passes.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use agentfleet_core::{
    AgentSpec, NodeId, NodeRegistration, TaskAssignment, TaskResult, TaskStatus,
};
use agentfleet_proto::{write_frame, Frame, FrameError, FrameReader};

use crate::controller::{Controller, DispatchRequest};

type Reader = FrameReader<BufReader<OwnedReadHalf>>;

/// Replies queued by the session reader for the writer task.
const REPLY_BUFFER: usize = 32;

/// Framed JSON listener.
#[derive(Clone)]
pub struct FramedServer {
    controller: Arc<Controller>,
    poll_interval: Duration,
    poll_deadline: Duration,
}

impl FramedServer {
    pub fn new(controller: Arc<Controller>) -> Self {
        Self {
            controller,
            poll_interval: Duration::from_millis(500),
            poll_deadline: Duration::from_secs(300),
        }
    }

    /// Builder method to tune how dispatch clients are updated.
    pub fn with_polling(mut self, interval: Duration, deadline: Duration) -> Self {
        self.poll_interval = interval;
        self.poll_deadline = deadline;
        self
    }

    /// Accept connections until `shutdown` fires.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> std::io::Result<()> {
        info!(addr = %listener.local_addr()?, "Framed server listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "Connection accepted");
                        let server = self.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_connection(stream, shutdown).await {
                                debug!(peer = %peer, error = %e, "Connection ended with error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Failed to accept connection"),
                },
                _ = shutdown.cancelled() => {
                    info!("Framed server stopped");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_connection(self, stream: TcpStream, shutdown: CancellationToken) -> Result<(), FrameError> {
        let (read, mut writer) = stream.into_split();
        let mut reader = FrameReader::new(BufReader::new(read));

        let first = match reader.next_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(e) => {
                // Best effort: the peer may already be gone.
                let _ = write_frame(&mut writer, &Frame::error(e.to_string())).await;
                return Err(e);
            }
        };

        match first {
            Frame::Register {
                token,
                node_name,
                address,
                labels,
                version,
            } => {
                let registration = NodeRegistration {
                    name: node_name,
                    address,
                    labels,
                    version,
                };
                self.run_node_session(token, registration, reader, writer, shutdown)
                    .await
            }
            Frame::Dispatch {
                token,
                agent,
                prompt,
                metadata,
                priority,
            } => {
                let request = DispatchRequest::new(agent, prompt)
                    .with_metadata(metadata)
                    .with_priority(priority);
                self.run_dispatch(token, request, writer, shutdown).await
            }
            other => {
                let message = format!("expected register or dispatch, got {}", other.kind());
                write_frame(&mut writer, &Frame::error(message)).await
            }
        }
    }

    // ------------------------------------------------------------------
    // Node sessions
    // ------------------------------------------------------------------

    async fn run_node_session(
        &self,
        token: Option<String>,
        registration: NodeRegistration,
        mut reader: Reader,
        mut writer: OwnedWriteHalf,
        shutdown: CancellationToken,
    ) -> Result<(), FrameError> {
        if let Err(e) = self.controller.authorize(token.as_deref()) {
            warn!(name = %registration.name, "Rejected node registration: invalid token");
            return write_frame(&mut writer, &Frame::error(e.to_string())).await;
        }

        let node_id = match self.controller.register_node(registration).await {
            Ok(id) => id,
            Err(e) => return write_frame(&mut writer, &Frame::error(e.to_string())).await,
        };
        let tasks = match self.controller.attach(&node_id) {
            Ok(rx) => rx,
            Err(e) => {
                self.end_session(&node_id).await;
                return write_frame(&mut writer, &Frame::error(e.to_string())).await;
            }
        };

        let registered = Frame::Registered {
            node_id: node_id.clone(),
        };
        if let Err(e) = write_frame(&mut writer, &registered).await {
            self.end_session(&node_id).await;
            return Err(e);
        }

        let closed = shutdown.child_token();
        let (reply_tx, reply_rx) = mpsc::channel(REPLY_BUFFER);
        let writer_task = tokio::spawn(write_loop(
            node_id.clone(),
            writer,
            reply_rx,
            tasks,
            closed.clone(),
        ));

        let result = loop {
            let frame = tokio::select! {
                frame = reader.next_frame() => frame,
                _ = closed.cancelled() => break Ok(()),
            };

            match frame {
                Ok(Some(frame)) => {
                    if let Some(reply) = self.handle_session_frame(&node_id, frame).await {
                        if reply_tx.send(reply).await.is_err() {
                            break Ok(());
                        }
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) if e.is_recoverable() => {
                    warn!(node_id = %node_id, error = %e, "Malformed frame");
                    if reply_tx.send(Frame::error(format!("malformed frame: {e}"))).await.is_err() {
                        break Ok(());
                    }
                }
                Err(e) => break Err(e),
            }
        };

        // Leave the registry before the task queue closes.
        self.end_session(&node_id).await;
        closed.cancel();
        drop(reply_tx);
        if let Err(e) = writer_task.await {
            error!(node_id = %node_id, error = %e, "Writer task panicked");
        }
        result
    }

    async fn end_session(&self, node_id: &NodeId) {
        if let Err(e) = self.controller.disconnect(node_id).await {
            error!(node_id = %node_id, error = %e, "Failed to record disconnect");
        }
    }

    /// Handle one frame from a registered node. Returns the reply, if the
    /// frame has one.
    async fn handle_session_frame(&self, node_id: &NodeId, frame: Frame) -> Option<Frame> {
        debug!(node_id = %node_id, kind = frame.kind(), "Session frame");

        match frame {
            Frame::Heartbeat { node_id: claimed } => {
                if claimed.as_ref().is_some_and(|c| c != node_id) {
                    return Some(Frame::error("heartbeat node_id does not match session"));
                }
                Some(match self.controller.heartbeat(node_id).await {
                    Ok(_) => Frame::HeartbeatAck,
                    Err(e) => Frame::error(e.to_string()),
                })
            }
            Frame::RegisterAgent {
                agent_name,
                cluster,
                namespace,
                description,
                model,
                skills,
            } => {
                let spec = AgentSpec {
                    name: agent_name,
                    cluster,
                    namespace,
                    description,
                    model,
                    skills,
                };
                Some(match self.controller.register_agent(node_id, spec).await {
                    Ok(agent_id) => Frame::AgentRegistered { agent_id },
                    Err(e) => Frame::error(e.to_string()),
                })
            }
            Frame::DeregisterAgent { agent_id } => {
                Some(match self.controller.deregister_agent(node_id, &agent_id).await {
                    Ok(()) => Frame::AgentDeregistered { agent_id },
                    Err(e) => Frame::error(e.to_string()),
                })
            }
            Frame::TaskResult {
                task_id,
                result,
                error,
            } => {
                let result = TaskResult::from_parts(task_id, result, error);
                if let Err(e) = self.controller.report_result(node_id, result).await {
                    warn!(node_id = %node_id, error = %e, "Failed to record task result");
                }
                None
            }
            Frame::TaskProgress { task_id, status } => {
                if let Err(e) = self.controller.report_progress(node_id, &task_id, status).await {
                    warn!(node_id = %node_id, task_id = %task_id, error = %e, "Failed to record task progress");
                }
                None
            }
            other => Some(Frame::error(format!(
                "unexpected {} frame in node session",
                other.kind()
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Dispatch clients
    // ------------------------------------------------------------------

    async fn run_dispatch(
        &self,
        token: Option<String>,
        request: DispatchRequest,
        mut writer: OwnedWriteHalf,
        shutdown: CancellationToken,
    ) -> Result<(), FrameError> {
        if let Err(e) = self.controller.authorize(token.as_deref()) {
            warn!(agent = %request.agent_name, "Rejected dispatch: invalid token");
            return write_frame(&mut writer, &Frame::error(e.to_string())).await;
        }

        let outcome = match self.controller.dispatch(request).await {
            Ok(outcome) => outcome,
            Err(e) => return write_frame(&mut writer, &Frame::error(e.to_string())).await,
        };
        let task_id = outcome.task_id;
        write_frame(
            &mut writer,
            &Frame::TaskCreated {
                task_id: task_id.clone(),
            },
        )
        .await?;

        let deadline = Instant::now() + self.poll_deadline;
        let mut last_status = outcome.status;
        let mut ticker = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => {
                    let frame = Frame::TaskFailed { task_id, error: "controller shutting down".into() };
                    return write_frame(&mut writer, &frame).await;
                }
            }

            let task = match self.controller.get_task(&task_id).await {
                Ok(task) => task,
                Err(e) => return write_frame(&mut writer, &Frame::error(e.to_string())).await,
            };

            match task.status {
                TaskStatus::Completed => {
                    let frame = Frame::TaskCompleted {
                        task_id,
                        result: task.result,
                    };
                    return write_frame(&mut writer, &frame).await;
                }
                TaskStatus::Failed | TaskStatus::Timeout => {
                    let frame = Frame::TaskFailed {
                        task_id,
                        error: task.error.unwrap_or_default(),
                    };
                    return write_frame(&mut writer, &frame).await;
                }
                status if status != last_status => {
                    last_status = status;
                    let frame = Frame::TaskProgress {
                        task_id: task_id.clone(),
                        status,
                    };
                    write_frame(&mut writer, &frame).await?;
                }
                _ => {}
            }

            if Instant::now() >= deadline {
                info!(task_id = %task_id, "Dispatch client poll deadline reached");
                let frame = Frame::TaskFailed {
                    task_id,
                    error: "timed out waiting for task result".into(),
                };
                return write_frame(&mut writer, &frame).await;
            }
        }
    }
}

/// Drain replies and queued tasks onto the socket until the session closes.
async fn write_loop(
    node_id: NodeId,
    mut writer: OwnedWriteHalf,
    mut replies: mpsc::Receiver<Frame>,
    mut tasks: mpsc::Receiver<TaskAssignment>,
    closed: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            reply = replies.recv() => match reply {
                Some(frame) => frame,
                None => break,
            },
            task = tasks.recv() => match task {
                Some(assignment) => {
                    debug!(node_id = %node_id, task_id = %assignment.task_id, "Sending task");
                    Frame::task(assignment)
                }
                None => break,
            },
            _ = closed.cancelled() => break,
        };

        match write_frame(&mut writer, &frame).await {
            Ok(()) => {}
            Err(FrameError::TooLarge) => {
                warn!(node_id = %node_id, kind = frame.kind(), "Dropping oversized frame");
            }
            Err(e) => {
                warn!(node_id = %node_id, error = %e, "Failed to write to node");
                break;
            }
        }
    }
    closed.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControllerSettings;
    use agentfleet_store::MemoryStore;
    use std::collections::HashMap;
    use tokio::io::AsyncWriteExt;

    fn dispatch_frame(agent: &str, prompt: &str, token: Option<&str>) -> Frame {
        Frame::Dispatch {
            token: token.map(str::to_string),
            agent: agent.to_string(),
            prompt: prompt.to_string(),
            metadata: HashMap::new(),
            priority: 0,
        }
    }

    async fn start(token: Option<&str>) -> (std::net::SocketAddr, Arc<Controller>, CancellationToken) {
        let shutdown = CancellationToken::new();
        let controller = Arc::new(Controller::new(
            Arc::new(MemoryStore::new()),
            ControllerSettings {
                token: token.map(str::to_string),
                ..Default::default()
            },
            shutdown.clone(),
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = FramedServer::new(controller.clone())
            .with_polling(Duration::from_millis(20), Duration::from_secs(5));
        tokio::spawn(server.serve(listener, shutdown.clone()));
        (addr, controller, shutdown)
    }

    async fn open(addr: std::net::SocketAddr) -> (Reader, OwnedWriteHalf) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, write) = stream.into_split();
        (FrameReader::new(BufReader::new(read)), write)
    }

    #[tokio::test]
    async fn test_register_heartbeat_and_disconnect() {
        let (addr, controller, _shutdown) = start(None).await;
        let (mut reader, mut writer) = open(addr).await;

        write_frame(&mut writer, &Frame::register(NodeRegistration::new("worker-1"), None))
            .await
            .unwrap();
        let node_id = match reader.next_frame().await.unwrap() {
            Some(Frame::Registered { node_id }) => node_id,
            other => panic!("unexpected {other:?}"),
        };
        assert_ne!(node_id.as_str(), "worker-1");

        for _ in 0..2 {
            write_frame(&mut writer, &Frame::Heartbeat { node_id: None })
                .await
                .unwrap();
            assert_eq!(reader.next_frame().await.unwrap(), Some(Frame::HeartbeatAck));
        }

        writer.shutdown().await.unwrap();
        drop(writer);
        drop(reader);

        for _ in 0..100 {
            if controller.connected_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(controller.connected_count(), 0);
        let node = controller.store().get_node(&node_id).await.unwrap();
        assert_eq!(node.status, agentfleet_core::NodeStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_unreadable_line_keeps_session_open() {
        let (addr, controller, _shutdown) = start(None).await;
        let (mut reader, mut writer) = open(addr).await;

        write_frame(&mut writer, &Frame::register(NodeRegistration::new("worker-1"), None))
            .await
            .unwrap();
        assert!(matches!(reader.next_frame().await.unwrap(), Some(Frame::Registered { .. })));

        writer.write_all(b"\xff\xfe not utf-8\n").await.unwrap();
        match reader.next_frame().await.unwrap() {
            Some(Frame::Error { error }) => assert!(error.contains("UTF-8"), "{error}"),
            other => panic!("unexpected {other:?}"),
        }

        writer.write_all(b"{\"type\":\"heartbeat\"\n").await.unwrap();
        assert!(matches!(reader.next_frame().await.unwrap(), Some(Frame::Error { .. })));

        write_frame(&mut writer, &Frame::Heartbeat { node_id: None })
            .await
            .unwrap();
        assert_eq!(reader.next_frame().await.unwrap(), Some(Frame::HeartbeatAck));
        assert_eq!(controller.connected_count(), 1);
    }

    #[tokio::test]
    async fn test_bad_token_is_rejected() {
        let (addr, controller, _shutdown) = start(Some("secret")).await;
        let (mut reader, mut writer) = open(addr).await;

        write_frame(
            &mut writer,
            &Frame::register(NodeRegistration::new("worker-1"), Some("wrong".into())),
        )
        .await
        .unwrap();
        assert_eq!(
            reader.next_frame().await.unwrap(),
            Some(Frame::error("unauthorized: invalid token"))
        );
        assert_eq!(reader.next_frame().await.unwrap(), None);
        assert!(controller.store().list_nodes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_first_frame_closes_connection() {
        let (addr, _controller, _shutdown) = start(None).await;
        let (mut reader, mut writer) = open(addr).await;

        write_frame(&mut writer, &Frame::HeartbeatAck).await.unwrap();
        match reader.next_frame().await.unwrap() {
            Some(Frame::Error { error }) => assert!(error.contains("heartbeat_ack")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(reader.next_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dispatch_to_missing_agent() {
        let (addr, _controller, _shutdown) = start(None).await;
        let (mut reader, mut writer) = open(addr).await;

        write_frame(&mut writer, &dispatch_frame("coder", "hi", None))
            .await
            .unwrap();
        assert_eq!(
            reader.next_frame().await.unwrap(),
            Some(Frame::error("agent not found or no connected node running it"))
        );
    }

    #[tokio::test]
    async fn test_dispatch_client_sees_progress_and_completion() {
        let (addr, _controller, _shutdown) = start(None).await;

        // Node side, driven by hand.
        let (mut node_reader, mut node_writer) = open(addr).await;
        write_frame(&mut node_writer, &Frame::register(NodeRegistration::new("worker-1"), None))
            .await
            .unwrap();
        assert!(matches!(
            node_reader.next_frame().await.unwrap(),
            Some(Frame::Registered { .. })
        ));
        write_frame(&mut node_writer, &Frame::register_agent(AgentSpec::new("coder")))
            .await
            .unwrap();
        assert!(matches!(
            node_reader.next_frame().await.unwrap(),
            Some(Frame::AgentRegistered { .. })
        ));

        // Dispatch client.
        let (mut client_reader, mut client_writer) = open(addr).await;
        write_frame(&mut client_writer, &dispatch_frame("coder", "hi", None))
            .await
            .unwrap();
        let task_id = match client_reader.next_frame().await.unwrap() {
            Some(Frame::TaskCreated { task_id }) => task_id,
            other => panic!("unexpected {other:?}"),
        };

        let assignment = match node_reader.next_frame().await.unwrap() {
            Some(Frame::Task { task_id, prompt, .. }) => {
                assert_eq!(prompt, "hi");
                task_id
            }
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(assignment, task_id);

        write_frame(
            &mut node_writer,
            &Frame::TaskProgress {
                task_id: task_id.clone(),
                status: TaskStatus::Running,
            },
        )
        .await
        .unwrap();
        assert_eq!(
            client_reader.next_frame().await.unwrap(),
            Some(Frame::TaskProgress {
                task_id: task_id.clone(),
                status: TaskStatus::Running,
            })
        );

        write_frame(
            &mut node_writer,
            &Frame::task_result(TaskResult::success(task_id.clone(), "done")),
        )
        .await
        .unwrap();
        assert_eq!(
            client_reader.next_frame().await.unwrap(),
            Some(Frame::TaskCompleted {
                task_id,
                result: "done".into(),
            })
        );
    }
}
