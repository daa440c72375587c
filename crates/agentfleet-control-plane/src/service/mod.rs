//! gRPC service implementations.

pub mod node_service;

pub use node_service::NodeServiceImpl;
