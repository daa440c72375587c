//! Storage errors.

use std::fmt;

use thiserror::Error;

/// Kind of record a store holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Node,
    Agent,
    Task,
}

impl EntityKind {
    /// Collection name, used for directories and watch keys.
    pub fn collection(&self) -> &'static str {
        match self {
            Self::Node => "nodes",
            Self::Agent => "agents",
            Self::Task => "tasks",
        }
    }

    /// Watch key for a record of this kind.
    pub fn key(&self, id: &str) -> String {
        format!("{}/{}", self.collection(), id)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Node => "node",
            Self::Agent => "agent",
            Self::Task => "task",
        })
    }
}

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record with this id.
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    /// Leadership renewal by an instance that does not hold the lease.
    #[error("Not the leader: {0}")]
    NotLeader(String),

    /// The store was closed.
    #[error("Store is closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message() {
        let err = StoreError::not_found(EntityKind::Agent, "abc");
        assert_eq!(err.to_string(), "agent not found: abc");
        assert!(err.is_not_found());
    }
}
