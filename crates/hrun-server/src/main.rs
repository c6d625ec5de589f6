//! hrun-server: host run server.
//!
//! Listens on a Unix socket (or TCP), reads one JSON command record per
//! connection, runs the command on a fresh PTY and relays the terminal
//! stream until either side finishes.

mod auth;
mod config;
mod server;
mod session;

use clap::Parser;
use config::{CliOverrides, ServerConfig};
use hrun_core::Listener;
use server::HrunServer;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// hrun-server: run commands on a PTY for remote clients
#[derive(Parser, Debug)]
#[command(name = "hrun-server", version, about = "Host run server")]
struct Cli {
    /// Unix socket path to listen on
    #[arg(long)]
    socket: Option<String>,

    /// Listen on TCP host:port instead of a Unix socket
    #[arg(long)]
    tcp: Option<String>,

    /// Permit only this program (repeatable; replaces the config file list)
    #[arg(long = "allowed-cmd", value_name = "PROGRAM")]
    allowed_cmd: Vec<String>,

    /// Config file path
    #[arg(long, default_value = "~/.hrun/server.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting hrun-server");

    let config_path = PathBuf::from(&cli.config);
    let overrides = CliOverrides {
        socket: cli.socket,
        tcp: cli.tcp,
        allowed_commands: cli.allowed_cmd,
    };
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    // Bind failure is the one condition that stops the server outright.
    let listener = match Listener::bind(&server_config.endpoint).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(endpoint = %server_config.endpoint, error = %e, "failed to bind");
            std::process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            info!("received shutdown signal");
            shutdown.cancel();
        }
    });

    let hrun_server = HrunServer::new(&server_config);
    if let Err(e) = hrun_server.run(listener, shutdown).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    info!("hrun-server stopped");
}

/// Wait for SIGINT (Ctrl+C), SIGTERM or SIGQUIT.
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigquit = signal(SignalKind::quit()).expect("failed to install SIGQUIT handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
        _ = sigquit.recv() => {}
    }
}
