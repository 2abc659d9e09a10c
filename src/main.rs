// microvmd - Main Entry Point
//
// A lightweight daemon for spawning and managing cloud-hypervisor based
// microVMs with exec and callback support.

use anyhow::{Context, Result};
use clap::Parser;
use microvmd::callback::SessionManager;
use microvmd::config::Config;
use microvmd::rest;
use microvmd::server::Server;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

/// microvmd: microVM sandbox orchestration daemon
#[derive(Parser, Debug)]
#[command(name = "microvmd")]
#[command(version)]
#[command(about = "Spawns and manages cloud-hypervisor based microVMs", long_about = None)]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long, default_value = "./config.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .init();

    let config = if Path::new(&args.config).exists() {
        Config::load(&args.config)?
    } else {
        warn!("config file {} not found, using defaults", args.config);
        let mut config = Config::default();
        config.normalize();
        config
    };
    info!("server config: {config}");

    let sessions = Arc::new(SessionManager::new());
    let server = Arc::new(
        Server::new(config.clone(), sessions)
            .await
            .context("failed to create VM server")?,
    );

    let app = rest::router(server.clone());
    let bind_addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!("microvmd listening on {bind_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutting down, destroying all VMs");
    if let Err(e) = server.destroy_all().await {
        warn!("failed to destroy all VMs on shutdown: {e:#}");
    }
    info!("server stopped");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["microvmd"]);
        assert_eq!(args.config, "./config.toml");
        assert!(!args.verbose);
    }

    #[test]
    fn test_args_parsing() {
        let args = Args::parse_from(["microvmd", "--config", "/etc/microvmd.toml", "-v"]);
        assert_eq!(args.config, "/etc/microvmd.toml");
        assert!(args.verbose);
    }
}
