//! Control plane configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::controller::ControllerSettings;

/// Control plane configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Framed JSON listener address.
    pub framed_addr: String,

    /// gRPC server bind address.
    pub grpc_addr: String,

    /// HTTP admin bind address.
    pub http_addr: String,

    /// Directory for the file store.
    pub data_dir: PathBuf,

    /// Keep records in memory instead of `data_dir`.
    pub in_memory: bool,

    /// Shared bearer token. `None` disables authentication.
    pub token: Option<String>,

    /// Liveness sweep period.
    pub sweep_interval: Duration,

    /// Heartbeat age after which a node is marked not-ready.
    pub heartbeat_timeout: Duration,

    /// Per-node outbound task queue capacity.
    pub queue_capacity: usize,

    /// How long dispatch waits for room in a full node queue.
    pub enqueue_timeout: Duration,

    /// Wait used when a synchronous dispatch names no timeout.
    pub default_wait: Duration,

    /// Framed dispatch clients: task polling period.
    pub dispatch_poll_interval: Duration,

    /// Framed dispatch clients: give up polling after this long.
    pub dispatch_poll_deadline: Duration,

    /// Lease length when claiming leadership on a coordination-capable store.
    pub leader_ttl: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            framed_addr: "0.0.0.0:7400".to_string(),
            grpc_addr: "0.0.0.0:7401".to_string(),
            http_addr: "0.0.0.0:7402".to_string(),
            data_dir: PathBuf::from("./data"),
            in_memory: false,
            token: None,
            sweep_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            queue_capacity: 100,
            enqueue_timeout: Duration::from_secs(5),
            default_wait: Duration::from_secs(300),
            dispatch_poll_interval: Duration::from_millis(500),
            dispatch_poll_deadline: Duration::from_secs(300),
            leader_ttl: Duration::from_secs(15),
        }
    }
}

impl Config {
    /// The subset of settings the controller core needs.
    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            token: self.token.clone(),
            heartbeat_timeout: self.heartbeat_timeout,
            queue_capacity: self.queue_capacity,
            enqueue_timeout: self.enqueue_timeout,
            default_wait: self.default_wait,
        }
    }
}
