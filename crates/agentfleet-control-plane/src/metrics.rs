//! Prometheus metrics collection and formatting.
//!
//! This module provides metrics in Prometheus text exposition format.

use std::fmt::Write;

use agentfleet_core::{NodeStatus, TaskStatus};

use crate::controller::Controller;
use crate::error::ControllerResult;

const NODE_STATUSES: [NodeStatus; 3] = [NodeStatus::Ready, NodeStatus::NotReady, NodeStatus::Disconnected];

const TASK_STATUSES: [TaskStatus; 6] = [
    TaskStatus::Pending,
    TaskStatus::Dispatched,
    TaskStatus::Running,
    TaskStatus::Completed,
    TaskStatus::Failed,
    TaskStatus::Timeout,
];

/// Collect all metrics from the controller and format as Prometheus text.
pub async fn collect_metrics(controller: &Controller) -> ControllerResult<String> {
    let mut output = String::new();

    collect_node_metrics(controller, &mut output).await?;
    collect_task_metrics(controller, &mut output).await?;

    writeln!(
        output,
        "# HELP agentfleet_sessions_connected Number of live node sessions"
    )
    .ok();
    writeln!(output, "# TYPE agentfleet_sessions_connected gauge").ok();
    writeln!(output, "agentfleet_sessions_connected {}", controller.connected_count()).ok();

    Ok(output)
}

/// Persisted nodes by status.
async fn collect_node_metrics(controller: &Controller, output: &mut String) -> ControllerResult<()> {
    let nodes = controller.list_nodes().await?;

    writeln!(output, "# HELP agentfleet_nodes Number of known nodes by status").ok();
    writeln!(output, "# TYPE agentfleet_nodes gauge").ok();
    for status in NODE_STATUSES {
        let count = nodes.iter().filter(|n| n.status == status).count();
        writeln!(output, "agentfleet_nodes{{status=\"{status}\"}} {count}").ok();
    }
    Ok(())
}

/// Persisted tasks by status.
async fn collect_task_metrics(controller: &Controller, output: &mut String) -> ControllerResult<()> {
    let tasks = controller.store().list_tasks().await?;

    writeln!(output, "# HELP agentfleet_tasks Number of tasks by status").ok();
    writeln!(output, "# TYPE agentfleet_tasks gauge").ok();
    for status in TASK_STATUSES {
        let count = tasks.iter().filter(|t| t.status == status).count();
        writeln!(output, "agentfleet_tasks{{status=\"{status}\"}} {count}").ok();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use agentfleet_core::NodeRegistration;
    use agentfleet_store::MemoryStore;
    use tokio_util::sync::CancellationToken;

    use crate::controller::ControllerSettings;

    #[tokio::test]
    async fn test_metrics_count_nodes_and_sessions() {
        let controller = Controller::new(
            Arc::new(MemoryStore::new()),
            ControllerSettings::default(),
            CancellationToken::new(),
        );
        controller
            .register_node(NodeRegistration::new("worker-1"))
            .await
            .unwrap();

        let output = collect_metrics(&controller).await.unwrap();
        assert!(output.contains("agentfleet_nodes{status=\"ready\"} 1"));
        assert!(output.contains("agentfleet_nodes{status=\"not-ready\"} 0"));
        assert!(output.contains("agentfleet_tasks{status=\"pending\"} 0"));
        assert!(output.contains("agentfleet_sessions_connected 1"));
    }
}
