//! Task execution shared by both transports.
//!
//! The dispatcher pulls assignments off the inbound queue and runs each one
//! in its own tokio task, so a slow agent never delays heartbeats or other
//! tasks. Progress and results come back as [`ExecutionEvent`]s for the
//! transport to forward.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use agentfleet_core::{TaskAssignment, TaskId, TaskResult};
use agentfleet_proto::MAX_PAYLOAD_LEN;

use crate::runner::AgentRunner;

/// Buffer for execution events awaiting the transport.
pub const EVENT_BUFFER: usize = 64;

/// What a running task reports back.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    Started(TaskId),
    Finished(TaskResult),
}

/// Run every assignment received until `stopped` fires or the queue closes.
/// In-flight executions are left to finish.
pub fn spawn_dispatcher(
    runner: Arc<dyn AgentRunner>,
    mut assignments: mpsc::Receiver<TaskAssignment>,
    events: mpsc::Sender<ExecutionEvent>,
    stopped: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let assignment = tokio::select! {
                assignment = assignments.recv() => match assignment {
                    Some(assignment) => assignment,
                    None => break,
                },
                _ = stopped.cancelled() => break,
            };
            tokio::spawn(execute(runner.clone(), assignment, events.clone()));
        }
        debug!("Task dispatcher stopped");
    })
}

async fn execute(runner: Arc<dyn AgentRunner>, assignment: TaskAssignment, events: mpsc::Sender<ExecutionEvent>) {
    let TaskAssignment {
        task_id,
        agent_name,
        prompt,
        ..
    } = assignment;

    info!(task_id = %task_id, agent = %agent_name, "Starting task");
    if events.send(ExecutionEvent::Started(task_id.clone())).await.is_err() {
        warn!(task_id = %task_id, "Connection gone before task started");
    }

    let result = match runner.run(&agent_name, &prompt).await {
        Ok(output) if output.len() > MAX_PAYLOAD_LEN => {
            warn!(task_id = %task_id, output_len = output.len(), "Task output too large");
            TaskResult::failure(task_id, oversized_output_error(output.len()))
        }
        Ok(output) => {
            info!(task_id = %task_id, output_len = output.len(), "Task completed");
            TaskResult::success(task_id, output)
        }
        Err(e) => {
            warn!(task_id = %task_id, error = %e, "Task failed");
            TaskResult::failure(task_id, e.to_string())
        }
    };

    if let Err(e) = events.send(ExecutionEvent::Finished(result)).await {
        warn!(task_id = %e.0.task_id(), "Connection gone, result dropped");
    }
}

/// Error reported in place of an output no transport can carry.
pub fn oversized_output_error(len: usize) -> String {
    format!("output of {len} bytes exceeds {MAX_PAYLOAD_LEN} bytes")
}

impl ExecutionEvent {
    pub fn task_id(&self) -> &TaskId {
        match self {
            ExecutionEvent::Started(id) => id,
            ExecutionEvent::Finished(result) => &result.task_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{fn_runner, RunnerError};
    use std::collections::HashMap;
    use std::time::Duration;

    fn assignment(id: &str, prompt: &str) -> TaskAssignment {
        TaskAssignment {
            task_id: TaskId::new(id),
            agent_name: "coder".to_string(),
            prompt: prompt.to_string(),
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_slow_task_does_not_block_others() {
        let runner = Arc::new(fn_runner(|_agent, prompt: String| async move {
            if prompt == "slow" {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            if prompt == "bad" {
                return Err(RunnerError::from("boom"));
            }
            if prompt == "huge" {
                return Ok("x".repeat(MAX_PAYLOAD_LEN + 1));
            }
            Ok::<_, RunnerError>(prompt)
        }));

        let (assign_tx, assign_rx) = mpsc::channel(8);
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let stopped = CancellationToken::new();
        let dispatcher = spawn_dispatcher(runner, assign_rx, event_tx, stopped.clone());

        assign_tx.send(assignment("t1", "slow")).await.unwrap();
        assign_tx.send(assignment("t2", "fast")).await.unwrap();
        assign_tx.send(assignment("t3", "bad")).await.unwrap();
        assign_tx.send(assignment("t4", "huge")).await.unwrap();

        let mut finished = Vec::new();
        while finished.len() < 3 {
            match event_rx.recv().await.unwrap() {
                ExecutionEvent::Finished(result) => finished.push(result),
                ExecutionEvent::Started(_) => {}
            }
        }
        finished.sort_by(|a, b| a.task_id.as_str().cmp(b.task_id.as_str()));
        assert_eq!(finished[0], TaskResult::success(TaskId::new("t2"), "fast"));
        assert_eq!(finished[1], TaskResult::failure(TaskId::new("t3"), "boom"));
        assert_eq!(
            finished[2],
            TaskResult::failure(TaskId::new("t4"), oversized_output_error(MAX_PAYLOAD_LEN + 1))
        );

        stopped.cancel();
        dispatcher.await.unwrap();
    }
}
