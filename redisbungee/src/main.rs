use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};

use redisbungee_cluster::{LoggingAdapter, PresenceNode, RedisStore};
use redisbungee_core::{
    bootstrap::{ensure_valid, load_config},
    logging, ProxyIdentity,
};

#[derive(Parser, Debug)]
#[command(name = "redisbungee")]
#[command(about = "Network-wide player presence for a fleet of proxies", long_about = None)]
struct Args {
    /// Config file (YAML, TOML or JSON)
    #[arg(long, short = 'c')]
    config: Option<String>,

    /// This proxy's id (defaults to the configured value, then the hostname)
    #[arg(long, env = "PROXY_ID")]
    proxy_id: Option<String>,

    /// Network this proxy belongs to
    #[arg(long, env = "NETWORK_ID")]
    network_id: Option<String>,
}

/// Hostname of this machine, used when no proxy id is configured
fn default_proxy_id() -> Option<String> {
    hostname::get().ok().and_then(|h| h.into_string().ok())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration, CLI flags win
    let mut config = load_config(args.config.as_deref())?;
    if let Some(proxy_id) = args.proxy_id {
        config.proxy.proxy_id = proxy_id;
    }
    if let Some(network_id) = args.network_id {
        config.proxy.network_id = network_id;
    }
    if config.proxy.proxy_id.trim().is_empty() {
        if let Some(hostname) = default_proxy_id() {
            config.proxy.proxy_id = hostname;
        }
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;

    // 3. Fail fast on misconfiguration
    ensure_valid(&config)?;
    let identity = ProxyIdentity::from_config(&config.proxy)?;
    info!(
        proxy_id = %identity.proxy_id(),
        network_id = %identity.network_id(),
        "RedisBungee starting..."
    );

    // 4. Connect to Redis
    let store = RedisStore::connect(&config.redis.url, config.redis.operation_timeout())
        .await
        .map_err(|e| {
            error!("Failed to connect to Redis: {}", e);
            anyhow::anyhow!("Redis connection failed: {e}")
        })?;
    info!("Connected to Redis");

    // 5. Join the network
    let node = PresenceNode::new(&config, identity, Arc::new(store), Arc::new(LoggingAdapter))?;
    node.start().await?;

    // 6. Run until asked to stop
    shutdown_signal().await;
    info!("Shutdown signal received, leaving the network...");

    if let Err(e) = node.shutdown().await {
        warn!("Unclean shutdown, claims will expire on their own: {}", e);
    }
    info!("RedisBungee stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
