//! AgentFleet node client.
//!
//! A node registers with the control plane, advertises the agents it hosts
//! and executes the tasks dispatched to them through an [`AgentRunner`].
//! Two transports are provided with the same surface:
//! - [`FramedNodeClient`]: newline-delimited JSON over TCP
//! - [`GrpcNodeClient`]: unary RPCs plus the bidirectional task stream

pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod framed;
pub mod grpc;
pub mod heartbeat;
pub mod runner;
pub mod state;

pub use client::{connect, NodeClient};
pub use config::{Config, Transport};
pub use error::ClientError;
pub use framed::FramedNodeClient;
pub use grpc::GrpcNodeClient;
pub use runner::{fn_runner, AgentRunner, CommandRunner, EchoRunner, FnRunner, RunnerError};
