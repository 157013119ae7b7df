//! # relay-gateway
//!
//! Relay gateway binary — wires the method registry and backend connector
//! together and starts the HTTP/WebSocket server.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use relay_backend::example::{ExampleBackend, HelloRequest, StreamRequest};
use relay_backend::StaticConnector;
use relay_server::config::ServerConfig;
use relay_server::registry::MethodRegistry;
use relay_server::server::RelayServer;

/// Relay gateway server.
#[derive(Parser, Debug)]
#[command(name = "relay-gateway", about = "WebSocket to backend RPC bridge")]
struct Cli {
    /// Host to bind (overrides config if specified).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides config if specified, 0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Path to a JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Register the bridged backend methods.
fn register_methods(registry: &mut MethodRegistry) {
    registry.register_unary::<HelloRequest>("SayHello");
    registry.register_stream::<StreamRequest>("StreamMessages");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut config = ServerConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let metrics_handle =
        relay_server::metrics::install_recorder().context("Failed to install metrics recorder")?;

    let mut registry = MethodRegistry::new();
    register_methods(&mut registry);
    let method_count = registry.methods().len();

    let connector = Arc::new(StaticConnector::new(Arc::new(ExampleBackend)));
    let server =
        RelayServer::new(config.clone(), registry, connector).with_metrics(metrics_handle);

    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!("relay gateway listening on http://{addr} ({method_count} methods registered)");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server
        .sessions()
        .graceful_shutdown(config.shutdown_grace())
        .await;
    let _ = handle.await;

    tracing::info!("Shutdown complete");
    Ok(())
}
