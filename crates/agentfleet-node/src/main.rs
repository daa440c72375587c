//! AgentFleet Node Daemon

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use agentfleet_core::AgentSpec;
use agentfleet_node::state::load_node_id;
use agentfleet_node::{connect, AgentRunner, ClientError, CommandRunner, Config, EchoRunner, Transport};

/// AgentFleet node daemon.
#[derive(Parser, Debug)]
#[command(name = "agentfleet-node", about = "AgentFleet node daemon")]
struct Args {
    /// Control plane address
    #[arg(long, default_value = "127.0.0.1:7400")]
    controller: String,

    /// Wire protocol
    #[arg(long, value_enum, default_value_t = Transport::Framed)]
    transport: Transport,

    /// Node name reported at registration (defaults to $HOSTNAME)
    #[arg(long)]
    name: Option<String>,

    /// Address reported at registration
    #[arg(long, default_value = "")]
    address: String,

    /// Node label as key=value, repeatable
    #[arg(long = "label", value_parser = parse_label)]
    labels: Vec<(String, String)>,

    /// Shared bearer token
    #[arg(long, env = "AGENTFLEET_TOKEN")]
    token: Option<String>,

    /// Heartbeat period in seconds
    #[arg(long, default_value = "10")]
    heartbeat_secs: u64,

    /// File receiving the assigned node id
    #[arg(long, default_value = "./node-id")]
    state_file: PathBuf,

    /// Agent hosted by this node, repeatable
    #[arg(long = "agent", required = true)]
    agents: Vec<String>,

    /// Program run for each task with the prompt on stdin; echoes the prompt when unset
    #[arg(long)]
    command: Option<PathBuf>,

    /// Arguments placed before the agent name
    #[arg(long = "command-arg", allow_hyphen_values = true)]
    command_args: Vec<String>,

    /// Seconds to wait before reconnecting; 0 exits instead
    #[arg(long, default_value = "5")]
    reconnect_delay_secs: u64,
}

fn parse_label(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{s}'"))
}

impl Args {
    fn config(&self) -> Config {
        let defaults = Config::default();
        Config {
            controller_addr: self.controller.clone(),
            transport: self.transport,
            node_name: self.name.clone().unwrap_or(defaults.node_name),
            address: self.address.clone(),
            labels: self.labels.iter().cloned().collect::<HashMap<_, _>>(),
            token: self.token.clone().filter(|t| !t.is_empty()),
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs.max(1)),
            state_file: Some(self.state_file.clone()),
            ..defaults
        }
    }

    fn runner(&self) -> Arc<dyn AgentRunner> {
        match &self.command {
            Some(program) => Arc::new(CommandRunner::new(program).with_args(self.command_args.clone())),
            None => Arc::new(EchoRunner),
        }
    }
}

enum SessionEnd {
    Interrupted,
    Disconnected,
}

/// One connection from registration to disconnect.
async fn run_session(config: &Config, agents: &[String], runner: Arc<dyn AgentRunner>) -> Result<SessionEnd, ClientError> {
    let mut client = connect(config).await?;

    for name in agents {
        client.register_agent(AgentSpec::new(name.clone())).await?;
    }
    client.start(runner)?;

    let stopped = client.stopped();
    let end = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            SessionEnd::Interrupted
        }
        _ = stopped.cancelled() => SessionEnd::Disconnected,
    };

    if let Err(e) = client.stop().await {
        warn!(error = %e, "Error while stopping client");
    }
    Ok(end)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    let args = Args::parse();
    let config = args.config();
    let runner = args.runner();

    match load_node_id(&args.state_file).await {
        Ok(Some(previous)) => info!(previous_node_id = %previous, "Found node id from a previous run"),
        Ok(None) => {}
        Err(e) => warn!(path = %args.state_file.display(), error = %e, "Failed to read node id state file"),
    }

    info!(
        controller = %config.controller_addr,
        transport = %config.transport,
        node_name = %config.node_name,
        agents = ?args.agents,
        "Starting AgentFleet node"
    );

    // Reconnection loop
    loop {
        match run_session(&config, &args.agents, runner.clone()).await {
            Ok(SessionEnd::Interrupted) => return Ok(()),
            Ok(SessionEnd::Disconnected) => info!("Connection closed"),
            Err(e) => error!(error = %e, "Connection error"),
        }

        if args.reconnect_delay_secs == 0 {
            return Err("connection to control plane lost".into());
        }

        info!(delay_secs = args.reconnect_delay_secs, "Reconnecting");
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(args.reconnect_delay_secs)) => {}
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}
