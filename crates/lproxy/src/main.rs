use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use lproxy::{FileConfig, ProxyListener, TunnelPool};

/// lproxy - proxy local traffic through pooled WebSocket tunnels
#[derive(Parser, Debug)]
#[command(name = "lproxy")]
#[command(about = "Multiplex local connections over a pool of gateway tunnels")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "lproxy.toml")]
    config: String,

    /// Gateway WebSocket URL (e.g., wss://gateway.example.com/ws)
    #[arg(long)]
    gateway: Option<String>,

    /// Number of tunnels to keep open
    #[arg(long)]
    tunnels: Option<usize>,

    /// Max concurrent connections per tunnel
    #[arg(long)]
    capacity: Option<usize>,

    /// SOCKS5 / HTTP CONNECT listen address
    #[arg(long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install crypto provider before any TLS operations
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("lproxy=info".parse()?)
                .add_directive("lproxy_common=info".parse()?),
        )
        .init();

    let args = Args::parse();
    tracing::info!("Starting lproxy with config: {}", args.config);

    let mut config = FileConfig::load_and_resolve(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config))?;

    // CLI flags take precedence over env and file
    if let Some(gateway) = args.gateway {
        config.pool.gateway_url = gateway;
    }
    if let Some(tunnels) = args.tunnels {
        config.pool.tunnel_count = tunnels;
    }
    if let Some(capacity) = args.capacity {
        config.pool.tunnel_capacity = capacity;
    }
    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    tracing::info!("Gateway: {}", config.pool.gateway_url);
    tracing::info!("Control DNS server: {}", config.pool.dns_server);

    let pool = Arc::new(TunnelPool::new(config.pool));
    pool.startup().context("Failed to start tunnel pool")?;

    let listener = ProxyListener::bind(config.listen, pool.clone()).await?;

    tokio::select! {
        result = listener.run() => {
            if let Err(e) = result {
                tracing::error!("Proxy listener error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("Shutting down...");
        }
    }

    pool.shutdown().await?;
    tracing::info!("lproxy shutdown complete");
    Ok(())
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}
