//! # Relay Node
//!
//! Entry point: load configuration, start the gateway and workers, serve
//! until Ctrl+C, then shut down gracefully.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use relay_node::container::{NodeConfig, Overrides};
use relay_node::RelayNode;
use relay_telemetry::{init_telemetry, TelemetryConfig};
use rpc_gateway::domain::config::{humantime_serde::parse_duration, PendingBackend};
use tracing::info;

/// Queue-mediated RPC gateway with an in-process worker pool.
#[derive(Debug, Parser)]
#[command(name = "relay-node", version, about)]
struct Args {
    /// JSON configuration file
    #[arg(short, long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP call surface port
    #[arg(long, env = "RELAY_HTTP_PORT")]
    http_port: Option<u16>,

    /// Admin server port
    #[arg(long, env = "RELAY_ADMIN_PORT")]
    admin_port: Option<u16>,

    /// Default call timeout (`30s`, `500ms`, `1m`)
    #[arg(long, env = "RELAY_TIMEOUT", value_parser = parse_timeout)]
    timeout: Option<Duration>,

    /// Worker count
    #[arg(long, env = "RELAY_WORKERS")]
    workers: Option<usize>,

    /// Correlator instances
    #[arg(long, env = "RELAY_INSTANCES")]
    instances: Option<usize>,

    /// Broker URL
    #[arg(long, env = "RELAY_BROKER_URL")]
    broker_url: Option<String>,

    /// Pending-state backend (`local` or `shared`)
    #[arg(long, env = "RELAY_BACKEND")]
    backend: Option<PendingBackend>,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            http_port: self.http_port,
            admin_port: self.admin_port,
            timeout: self.timeout,
            workers: self.workers,
            instances: self.instances,
            broker_url: self.broker_url.clone(),
            backend: self.backend,
        }
    }
}

fn parse_timeout(value: &str) -> Result<Duration, String> {
    parse_duration(value).map_err(str::to_string)
}

/// Load configuration from the file (if any), then apply overrides.
fn load_config(args: &Args) -> Result<NodeConfig> {
    let mut config = match &args.config {
        Some(path) => NodeConfig::from_file(path)?,
        None => NodeConfig::default(),
    };
    args.overrides().apply(&mut config);
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let _telemetry = init_telemetry(TelemetryConfig::from_env().for_service("relay-node"))
        .context("Failed to initialize telemetry")?;

    let config = load_config(&args)?;

    info!("===========================================");
    info!("  Relay Node v{}", env!("CARGO_PKG_VERSION"));
    info!("===========================================");

    let node = Arc::new(
        RelayNode::start(config)
            .await
            .context("Failed to start relay node")?,
    );
    info!("HTTP: {}", node.config().gateway.http_addr());
    info!("Admin: {}", node.config().gateway.admin_addr());

    let mut server = {
        let node = Arc::clone(&node);
        tokio::spawn(async move { node.serve().await })
    };

    info!("Node is running. Press Ctrl+C to stop.");
    // Servers only return on their own after a bind or serve failure.
    let exited = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            None
        }
        result = &mut server => Some(result),
    };

    node.shutdown().await;

    let result = match exited {
        Some(result) => result,
        None => server.await,
    };
    result.context("Server task failed")?.context("Server error")?;

    Ok(())
}
