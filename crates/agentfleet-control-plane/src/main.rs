//! AgentFleet Control Plane Server

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use agentfleet_control_plane::{http, leadership, run_liveness_sweep, Config, Controller, FramedServer, NodeServiceImpl};
use agentfleet_core::NodeId;
use agentfleet_store::{FileStore, MemoryStore, Store};

/// AgentFleet control plane server.
#[derive(Parser, Debug)]
#[command(name = "agentfleet-control-plane", about = "AgentFleet control plane server")]
struct Args {
    /// Framed JSON listener address
    #[arg(long, default_value = "0.0.0.0:7400")]
    framed_addr: String,

    /// gRPC server address
    #[arg(long, default_value = "0.0.0.0:7401")]
    grpc_addr: String,

    /// HTTP admin server address
    #[arg(long, default_value = "0.0.0.0:7402")]
    http_addr: String,

    /// Directory for persisted records
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Keep records in memory only
    #[arg(long)]
    memory: bool,

    /// Shared bearer token; unset disables authentication
    #[arg(long, env = "AGENTFLEET_TOKEN")]
    token: Option<String>,

    /// Liveness sweep period in seconds
    #[arg(long, default_value = "30")]
    sweep_interval_secs: u64,

    /// Heartbeat age in seconds after which a node is marked not-ready
    #[arg(long, default_value = "60")]
    heartbeat_timeout_secs: u64,

    /// Default wait in seconds for synchronous dispatches
    #[arg(long, default_value = "300")]
    default_wait_secs: u64,
}

impl Args {
    fn into_config(self) -> Config {
        Config {
            framed_addr: self.framed_addr,
            grpc_addr: self.grpc_addr,
            http_addr: self.http_addr,
            data_dir: self.data_dir,
            in_memory: self.memory,
            token: self.token.filter(|t| !t.is_empty()),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
            default_wait: Duration::from_secs(self.default_wait_secs.max(1)),
            ..Config::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    let config = Args::parse().into_config();
    let grpc_addr: SocketAddr = config.grpc_addr.parse()?;

    // Open the store
    let store: Arc<dyn Store> = if config.in_memory {
        info!("Using in-memory store");
        Arc::new(MemoryStore::new())
    } else {
        info!(data_dir = %config.data_dir.display(), "Using file store");
        Arc::new(FileStore::open(&config.data_dir).await?)
    };

    let shutdown = CancellationToken::new();
    let instance_id = NodeId::generate().into_inner();
    if leadership::claim_leadership(store.as_ref(), &instance_id, config.leader_ttl)
        .await?
        .is_some()
    {
        tokio::spawn(leadership::run_leadership_renewal(
            store.clone(),
            instance_id.clone(),
            config.leader_ttl,
            shutdown.clone(),
        ));
        let watched = store.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = leadership::log_changes(watched, "nodes/", token).await {
                error!(error = %e, "Change watch failed");
            }
        });
    }

    let controller = Arc::new(Controller::new(
        store.clone(),
        config.controller_settings(),
        shutdown.clone(),
    ));

    info!(
        instance_id = %instance_id,
        framed_addr = %config.framed_addr,
        grpc_addr = %grpc_addr,
        http_addr = %config.http_addr,
        auth = config.token.is_some(),
        "Starting AgentFleet control plane"
    );

    // Background liveness sweep
    let sweep = tokio::spawn(run_liveness_sweep(
        controller.clone(),
        config.sweep_interval,
        shutdown.clone(),
    ));

    // Framed JSON server
    let framed_listener = TcpListener::bind(&config.framed_addr).await?;
    let framed_server = FramedServer::new(controller.clone())
        .with_polling(config.dispatch_poll_interval, config.dispatch_poll_deadline)
        .serve(framed_listener, shutdown.clone());

    // gRPC server
    let grpc_token = shutdown.clone();
    let grpc_server = Server::builder()
        .add_service(NodeServiceImpl::new(controller.clone()).into_server())
        .serve_with_shutdown(grpc_addr, async move { grpc_token.cancelled().await });

    // HTTP admin server
    let http_listener = TcpListener::bind(&config.http_addr).await?;
    let http_token = shutdown.clone();
    let http_server = axum::serve(http_listener, http::create_router(controller.clone()))
        .with_graceful_shutdown(async move { http_token.cancelled().await });

    // Ctrl-C cancels everything
    let signal_controller = controller.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl-C"),
        }
        signal_controller.shutdown();
    });

    // Run all servers concurrently; the first to stop brings the rest down
    tokio::select! {
        result = framed_server => {
            if let Err(e) = result {
                error!(error = %e, "Framed server error");
            }
        }
        result = grpc_server => {
            if let Err(e) = result {
                error!(error = %e, "gRPC server error");
            }
        }
        result = http_server => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
    }

    controller.shutdown();
    if let Err(e) = sweep.await {
        error!(error = %e, "Liveness sweep panicked");
    }
    store.close().await?;

    info!("AgentFleet control plane stopped");
    Ok(())
}
