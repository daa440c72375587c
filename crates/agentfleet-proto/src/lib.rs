//! Wire protocols for AgentFleet.
//!
//! This crate contains:
//! - Generated protobuf message types and gRPC service stubs
//! - Converters between proto types and domain types
//! - The newline-delimited JSON frame protocol ([`frame`])
//!
//! Both protocols carry the same logical message set.

pub mod convert;
pub mod frame;

/// Generated protobuf types and services.
pub mod pb {
    tonic::include_proto!("agentfleet.v1");
}

// Re-export commonly used types
pub use frame::{write_frame, Frame, FrameError, FrameReader, MAX_FRAME_LEN, MAX_PAYLOAD_LEN};
pub use pb::node_service_client::NodeServiceClient;
pub use pb::node_service_server::{NodeService, NodeServiceServer};
