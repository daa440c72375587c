//! Node records.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AgentId, NodeId, NodeStatus};

/// What a node tells the controller about itself when it registers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeRegistration {
    /// Human-readable node name (usually the hostname).
    pub name: String,

    /// Address the node advertises for operators.
    pub address: String,

    /// Node-level labels (region, hardware, tenant, etc.).
    pub labels: HashMap<String, String>,

    /// Node binary version.
    pub version: String,
}

impl NodeRegistration {
    /// Create a registration with just a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Builder method to set the advertised address.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Builder method to add a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Builder method to set the version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }
}

/// A worker process known to the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub address: String,
    pub labels: HashMap<String, String>,
    pub status: NodeStatus,
    pub version: String,
    pub joined_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,

    /// Agents currently hosted on this node.
    pub agent_ids: Vec<AgentId>,
}

impl Node {
    /// Create a freshly registered, ready node.
    pub fn new(id: NodeId, registration: NodeRegistration) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: registration.name,
            address: registration.address,
            labels: registration.labels,
            status: NodeStatus::Ready,
            version: registration.version,
            joined_at: now,
            last_seen: now,
            agent_ids: Vec::new(),
        }
    }

    /// Record a sighting. `last_seen` only ever moves forward.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.last_seen {
            self.last_seen = at;
        }
    }

    /// Add an agent back-reference, ignoring duplicates.
    pub fn add_agent(&mut self, agent_id: AgentId) {
        if !self.agent_ids.contains(&agent_id) {
            self.agent_ids.push(agent_id);
        }
    }

    /// Drop an agent back-reference. Returns true if it was present.
    pub fn remove_agent(&mut self, agent_id: &AgentId) -> bool {
        let before = self.agent_ids.len();
        self.agent_ids.retain(|id| id != agent_id);
        self.agent_ids.len() != before
    }
}
