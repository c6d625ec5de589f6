//! hrun: host run client.
//!
//! Runs a command on the host through hrun-server as if it were attached to
//! the local terminal. With no command, starts the user's shell.

mod commands;
mod config;
mod terminal;

use clap::Parser;
use std::path::PathBuf;
use tracing::error;

/// hrun: run a command on the host
#[derive(Parser, Debug)]
#[command(name = "hrun", version, about = "Run a command on the host through hrun-server")]
struct Cli {
    /// Server Unix socket path
    #[arg(long)]
    socket: Option<String>,

    /// Connect to a TCP server (host:port) instead of a Unix socket
    #[arg(long)]
    tcp: Option<String>,

    /// Config file path
    #[arg(long = "config")]
    config: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Command and arguments to run; defaults to $SHELL
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logs go to stderr so they never mix with relayed output.
    let filter = if cli.verbose {
        "hrun=debug,hrun_cli=debug,hrun_core=debug"
    } else {
        "hrun=warn,hrun_cli=warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(cli.verbose)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        eprintln!("hrun: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli
        .config
        .as_deref()
        .map(config::expand_tilde)
        .unwrap_or_else(config::default_path);
    let cfg = config::Config::load(&config_path)?;
    let endpoint = cfg.endpoint(cli.socket.as_deref(), cli.tcp.as_deref())?;
    commands::run::run(&endpoint, command_argv(cli.args)).await
}

/// The command to request: the given arguments, else `$SHELL`, else `/bin/sh`.
fn command_argv(args: Vec<String>) -> Vec<String> {
    if !args.is_empty() {
        return args;
    }
    let shell = std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string());
    vec![shell]
}
