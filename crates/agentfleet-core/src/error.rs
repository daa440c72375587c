//! Core domain errors.

use thiserror::Error;

/// Core domain errors for AgentFleet.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A status string did not name a known status.
    #[error("Unknown {kind} status: {value}")]
    UnknownStatus { kind: &'static str, value: String },

    /// Invalid state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
