//! Node client errors.

use thiserror::Error;

use agentfleet_proto::FrameError;

/// Errors that can occur while talking to the control plane.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("gRPC error: {0}")]
    Status(#[from] tonic::Status),

    #[error("Invalid controller address: {0}")]
    InvalidAddress(String),

    /// The controller answered with an `error` frame.
    #[error("Controller rejected request: {0}")]
    Rejected(String),

    #[error("Unexpected {0} frame")]
    UnexpectedFrame(&'static str),

    #[error("Client already started")]
    AlreadyStarted,

    #[error("Timed out waiting for controller reply")]
    Timeout,

    #[error("Connection closed")]
    Closed,
}
