//! termbridge-server: browser terminal bridge.
//!
//! Accepts WebSocket connections, authorizes them with a shared API key, and
//! multiplexes each connection's logical terminals onto PTY-backed shells.

mod auth;
mod config;
mod server;
mod session;
mod transport;

use clap::Parser;
use config::{CliOverrides, EnvOverrides, ServerConfig};
use server::TermBridgeServer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// termbridge-server: browser terminal bridge
#[derive(Parser, Debug)]
#[command(name = "termbridge-server", version, about = "Browser terminal bridge")]
struct Cli {
    /// Listen port (overrides SHELL_PORT and the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.termbridge/config.toml")]
    config: String,

    /// Shell to spawn for each terminal
    #[arg(long)]
    shell: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting termbridge-server");

    let config_path = PathBuf::from(&cli.config);
    let overrides = CliOverrides {
        port: cli.port,
        bind: cli.bind,
        shell: cli.shell,
    };
    let server_config =
        match ServerConfig::load(Some(&config_path), EnvOverrides::from_process(), overrides) {
            Ok(cfg) => cfg,
            Err(e) => {
                error!(error = %e, "failed to load config");
                std::process::exit(1);
            }
        };

    let server = match TermBridgeServer::new(server_config) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "failed to create server");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = server.clone().run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                server.shutdown().await;
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    server.shutdown().await;
    info!("termbridge-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
