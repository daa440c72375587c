//! AgentFleet Control Plane Library
//!
//! The control plane tracks nodes, the agents they host and the tasks
//! dispatched to them. One protocol-agnostic [`Controller`] holds the rules;
//! the framed JSON server, the gRPC service and the HTTP admin router only
//! translate their wire formats into controller calls.

pub mod config;
pub mod controller;
pub mod error;
pub mod framed;
pub mod http;
pub mod leadership;
pub mod liveness;
pub mod metrics;
pub mod registry;
pub mod service;

pub use config::Config;
pub use controller::{Controller, ControllerSettings, DispatchOutcome, DispatchRequest, TaskFilter};
pub use error::{ControllerError, ControllerResult};
pub use framed::FramedServer;
pub use liveness::run_liveness_sweep;
pub use service::NodeServiceImpl;
