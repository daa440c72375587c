//! HTTP request handlers.

mod health;
mod records;

pub use health::{health_check, metrics_handler};
pub use records::{get_task, list_agents, list_nodes, list_tasks};
