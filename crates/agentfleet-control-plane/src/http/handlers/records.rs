//! Read-only record listings.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use agentfleet_core::{Agent, Node, NodeId, Task, TaskId, TaskStatus};

use crate::controller::{Controller, TaskFilter, DEFAULT_LIST_LIMIT};
use crate::error::ControllerError;
use crate::http::responses::ApiError;

#[derive(Debug, Deserialize)]
pub struct AgentsQuery {
    pub node_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TasksQuery {
    pub status: Option<String>,
    pub agent: Option<String>,
    pub limit: Option<usize>,
}

pub async fn list_nodes(State(controller): State<Arc<Controller>>) -> Result<Json<Vec<Node>>, ApiError> {
    Ok(Json(controller.list_nodes().await?))
}

pub async fn list_agents(
    State(controller): State<Arc<Controller>>,
    Query(query): Query<AgentsQuery>,
) -> Result<Json<Vec<Agent>>, ApiError> {
    let node_id = query.node_id.map(NodeId::new);
    Ok(Json(controller.list_agents(node_id.as_ref()).await?))
}

pub async fn list_tasks(
    State(controller): State<Arc<Controller>>,
    Query(query): Query<TasksQuery>,
) -> Result<Json<Vec<Task>>, ApiError> {
    let status = query
        .status
        .map(|s| s.parse::<TaskStatus>())
        .transpose()
        .map_err(|e| ControllerError::InvalidArgument(e.to_string()))?;

    let filter = TaskFilter {
        status,
        agent_name: query.agent,
        limit: query.limit.unwrap_or(DEFAULT_LIST_LIMIT),
    };
    Ok(Json(controller.list_tasks(&filter).await?))
}

pub async fn get_task(
    State(controller): State<Arc<Controller>>,
    Path(task_id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(controller.get_task(&TaskId::new(task_id)).await?))
}
