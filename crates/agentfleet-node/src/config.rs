//! Node configuration.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use clap::ValueEnum;

use agentfleet_core::NodeRegistration;

/// Wire protocol used to reach the controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum Transport {
    /// Newline-delimited JSON over TCP.
    #[default]
    Framed,
    Grpc,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Framed => f.write_str("framed"),
            Transport::Grpc => f.write_str("grpc"),
        }
    }
}

/// Node configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Controller address: `host:port` for framed, a URL or `host:port` for gRPC.
    pub controller_addr: String,

    pub transport: Transport,

    /// Name reported at registration.
    pub node_name: String,

    /// Address reported at registration, informational only.
    pub address: String,

    pub labels: HashMap<String, String>,

    /// Shared bearer token.
    pub token: Option<String>,

    pub heartbeat_interval: Duration,

    /// How long to wait for a controller reply on the framed transport.
    pub reply_timeout: Duration,

    /// Where the assigned node id is written after registration.
    pub state_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            controller_addr: "127.0.0.1:7400".to_string(),
            transport: Transport::Framed,
            node_name: std::env::var("HOSTNAME").unwrap_or_else(|_| "agentfleet-node".to_string()),
            address: String::new(),
            labels: HashMap::new(),
            token: None,
            heartbeat_interval: Duration::from_secs(10),
            reply_timeout: Duration::from_secs(30),
            state_file: Some(PathBuf::from("./node-id")),
        }
    }
}

impl Config {
    /// The registration sent to the controller.
    pub fn registration(&self) -> NodeRegistration {
        let mut registration = NodeRegistration::new(self.node_name.clone())
            .with_address(self.address.clone())
            .with_version(env!("CARGO_PKG_VERSION"));
        registration.labels = self.labels.clone();
        registration
    }
}
