//! Agent records and the specification a node registers them from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AgentId, AgentStatus, NodeId};

/// Specification of an agent a node wants to host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Agent name; dispatch resolves by this name.
    pub name: String,
    pub cluster: String,
    pub namespace: String,
    pub description: String,
    pub model: String,
    pub skills: Vec<String>,
}

impl AgentSpec {
    /// Create a new AgentSpec with minimal required fields.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Builder method to set cluster and namespace.
    pub fn with_placement(mut self, cluster: impl Into<String>, namespace: impl Into<String>) -> Self {
        self.cluster = cluster.into();
        self.namespace = namespace.into();
        self
    }

    /// Builder method to set description.
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    /// Builder method to set the model name.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Builder method to add a skill.
    pub fn with_skill(mut self, skill: impl Into<String>) -> Self {
        self.skills.push(skill.into());
        self
    }
}

/// A named capability hosted by exactly one node.
///
/// The record outlives its node's connection: it is only removed by explicit
/// deregistration, so `node_id` may point at a disconnected node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub node_id: NodeId,
    pub cluster: String,
    pub namespace: String,
    pub description: String,
    pub model: String,
    pub skills: Vec<String>,
    pub status: AgentStatus,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl Agent {
    /// Create an agent record owned by `node_id`.
    pub fn new(node_id: NodeId, spec: AgentSpec) -> Self {
        let now = Utc::now();
        Self {
            id: AgentId::generate(),
            name: spec.name,
            node_id,
            cluster: spec.cluster,
            namespace: spec.namespace,
            description: spec.description,
            model: spec.model,
            skills: spec.skills,
            status: AgentStatus::Running,
            created_at: now,
            last_active: now,
        }
    }
}
