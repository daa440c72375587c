//! Node client over the framed JSON transport.
//!
//! Requests that expect a reply (`heartbeat`, `register_agent`,
//! `deregister_agent`) are answered in order, so each one queues a reply
//! slot while holding the writer lock and the reader fills slots front to
//! back. `task_result` and `task_progress` have no reply.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use agentfleet_core::{AgentId, AgentSpec, NodeId, TaskAssignment, TaskResult, TaskStatus};
use agentfleet_proto::{write_frame, Frame, FrameError, FrameReader};

use crate::client::NodeClient;
use crate::config::Config;
use crate::error::ClientError;
use crate::executor::{oversized_output_error, spawn_dispatcher, ExecutionEvent, EVENT_BUFFER};
use crate::heartbeat::run_heartbeat_loop;
use crate::runner::AgentRunner;
use crate::state::save_node_id;

/// Assignments buffered between the reader and the dispatcher.
const ASSIGNMENT_BUFFER: usize = 100;

type Reader = FrameReader<BufReader<OwnedReadHalf>>;

/// Write side of the connection plus the queue of awaited replies.
struct Connection {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Mutex<VecDeque<oneshot::Sender<Frame>>>,
    reply_timeout: Duration,
}

impl Connection {
    fn pending(&self) -> MutexGuard<'_, VecDeque<oneshot::Sender<Frame>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send a frame that has no reply.
    async fn send(&self, frame: &Frame) -> Result<(), ClientError> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, frame).await?;
        Ok(())
    }

    /// Send a frame and wait for its reply. An `error` reply becomes
    /// [`ClientError::Rejected`].
    async fn request(&self, frame: &Frame) -> Result<Frame, ClientError> {
        let rx = {
            let mut writer = self.writer.lock().await;
            let (tx, rx) = oneshot::channel();
            self.pending().push_back(tx);
            if let Err(e) = write_frame(&mut *writer, frame).await {
                self.pending().pop_back();
                return Err(e.into());
            }
            rx
        };

        let reply = tokio::time::timeout(self.reply_timeout, rx)
            .await
            .map_err(|_| ClientError::Timeout)?
            .map_err(|_| ClientError::Closed)?;

        match reply {
            Frame::Error { error } => Err(ClientError::Rejected(error)),
            reply => Ok(reply),
        }
    }

    /// Hand a reply to the oldest waiting request.
    fn deliver_reply(&self, frame: Frame) -> Result<(), Frame> {
        match self.pending().pop_front() {
            Some(tx) => {
                // The requester may have timed out; its slot is consumed either way.
                let _ = tx.send(frame);
                Ok(())
            }
            None => Err(frame),
        }
    }

    fn fail_pending(&self) {
        self.pending().clear();
    }
}

/// Node client speaking newline-delimited JSON over TCP.
pub struct FramedNodeClient {
    node_id: NodeId,
    conn: Arc<Connection>,
    assignments: Option<mpsc::Receiver<TaskAssignment>>,
    heartbeat_interval: Duration,
    stopped: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl FramedNodeClient {
    /// Dial the controller, register and start reading.
    pub async fn connect(config: &Config) -> Result<Self, ClientError> {
        info!(addr = %config.controller_addr, "Connecting to control plane");

        let stream = TcpStream::connect(&config.controller_addr).await?;
        let (read, mut writer) = stream.into_split();
        let mut reader: Reader = FrameReader::new(BufReader::new(read));

        let register = Frame::register(config.registration(), config.token.clone());
        write_frame(&mut writer, &register).await?;

        let reply = tokio::time::timeout(config.reply_timeout, reader.next_frame())
            .await
            .map_err(|_| ClientError::Timeout)??;
        let node_id = match reply {
            Some(Frame::Registered { node_id }) => node_id,
            Some(Frame::Error { error }) => return Err(ClientError::Rejected(error)),
            Some(other) => return Err(ClientError::UnexpectedFrame(other.kind())),
            None => return Err(ClientError::Closed),
        };
        info!(node_id = %node_id, "Registered with control plane");

        if let Some(path) = &config.state_file {
            if let Err(e) = save_node_id(path, &node_id).await {
                warn!(path = %path.display(), error = %e, "Failed to write node id state file");
            }
        }

        let conn = Arc::new(Connection {
            writer: tokio::sync::Mutex::new(writer),
            pending: Mutex::new(VecDeque::new()),
            reply_timeout: config.reply_timeout,
        });
        let stopped = CancellationToken::new();
        let (assign_tx, assign_rx) = mpsc::channel(ASSIGNMENT_BUFFER);
        let reader_task = tokio::spawn(read_loop(reader, conn.clone(), assign_tx, stopped.clone()));

        Ok(Self {
            node_id,
            conn,
            assignments: Some(assign_rx),
            heartbeat_interval: config.heartbeat_interval,
            stopped,
            tasks: vec![reader_task],
        })
    }
}

#[async_trait]
impl NodeClient for FramedNodeClient {
    fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    async fn register_agent(&self, spec: AgentSpec) -> Result<AgentId, ClientError> {
        let name = spec.name.clone();
        match self.conn.request(&Frame::register_agent(spec)).await? {
            Frame::AgentRegistered { agent_id } => {
                info!(agent_id = %agent_id, agent = %name, "Agent registered");
                Ok(agent_id)
            }
            other => Err(ClientError::UnexpectedFrame(other.kind())),
        }
    }

    async fn deregister_agent(&self, agent_id: &AgentId) -> Result<(), ClientError> {
        let frame = Frame::DeregisterAgent {
            agent_id: agent_id.clone(),
        };
        match self.conn.request(&frame).await? {
            Frame::AgentDeregistered { .. } => Ok(()),
            other => Err(ClientError::UnexpectedFrame(other.kind())),
        }
    }

    fn start(&mut self, runner: Arc<dyn AgentRunner>) -> Result<(), ClientError> {
        let assignments = self.assignments.take().ok_or(ClientError::AlreadyStarted)?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        self.tasks.push(spawn_dispatcher(
            runner,
            assignments,
            events_tx,
            self.stopped.clone(),
        ));
        self.tasks.push(tokio::spawn(forward_events(
            self.conn.clone(),
            events_rx,
            self.stopped.clone(),
        )));

        let conn = self.conn.clone();
        let node_id = self.node_id.clone();
        self.tasks.push(tokio::spawn(run_heartbeat_loop(
            self.heartbeat_interval,
            self.stopped.clone(),
            move || {
                let conn = conn.clone();
                let frame = Frame::Heartbeat {
                    node_id: Some(node_id.clone()),
                };
                async move {
                    match conn.request(&frame).await? {
                        Frame::HeartbeatAck => Ok(()),
                        other => Err(ClientError::UnexpectedFrame(other.kind())),
                    }
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
        self.stopped.cancel();
        let closed = self.conn.writer.lock().await.shutdown().await;

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task panicked");
            }
        }

        info!(node_id = %self.node_id, "Node client stopped");
        match closed {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for FramedNodeClient {
    fn drop(&mut self) {
        self.stopped.cancel();
    }
}

async fn read_loop(
    mut reader: Reader,
    conn: Arc<Connection>,
    assignments: mpsc::Sender<TaskAssignment>,
    stopped: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            frame = reader.next_frame() => frame,
            _ = stopped.cancelled() => break,
        };

        match frame {
            Ok(Some(Frame::Task {
                task_id,
                agent_name,
                prompt,
                metadata,
            })) => {
                debug!(task_id = %task_id, agent = %agent_name, "Received task");
                let assignment = TaskAssignment {
                    task_id,
                    agent_name,
                    prompt,
                    metadata,
                };
                if assignments.send(assignment).await.is_err() {
                    break;
                }
            }
            Ok(Some(
                reply @ (Frame::HeartbeatAck
                | Frame::AgentRegistered { .. }
                | Frame::AgentDeregistered { .. }
                | Frame::Error { .. }),
            )) => {
                if let Err(unmatched) = conn.deliver_reply(reply) {
                    warn!(kind = unmatched.kind(), frame = ?unmatched, "Reply with no pending request");
                }
            }
            Ok(Some(other)) => warn!(kind = other.kind(), "Ignoring unexpected frame"),
            Ok(None) => {
                info!("Control plane closed the connection");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Failed to read from control plane");
                break;
            }
        }
    }

    conn.fail_pending();
    stopped.cancel();
}

async fn forward_events(
    conn: Arc<Connection>,
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

        let frame = match event {
            ExecutionEvent::Started(task_id) => Frame::TaskProgress {
                task_id,
                status: TaskStatus::Running,
            },
            ExecutionEvent::Finished(result) => Frame::task_result(result),
        };
        let sent = match conn.send(&frame).await {
            // Escaping can push an output under the payload limit past the frame limit.
            Err(ClientError::Frame(FrameError::TooLarge)) => match frame {
                Frame::TaskResult { task_id, result, .. } => {
                    warn!(task_id = %task_id, "Task result frame too large, reporting failure");
                    let failure = TaskResult::failure(task_id, oversized_output_error(result.len()));
                    conn.send(&Frame::task_result(failure)).await
                }
                _ => Ok(()),
            },
            sent => sent,
        };
        if let Err(e) = sent {
            warn!(error = %e, "Failed to send to control plane, stopping client");
            stopped.cancel();
            break;
        }
    }
}
