//! Server configuration: TOML file + CLI overrides.

use hrun_core::transport::DEFAULT_SOCKET_PATH;
use hrun_core::{Endpoint, HrunError, HrunResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_socket")]
    pub socket: String,
    /// `host:port`; takes precedence over `socket` when set.
    #[serde(default)]
    pub tcp: Option<String>,
    #[serde(default)]
    pub allowed_commands: Vec<String>,
    #[serde(default = "default_max_command_bytes")]
    pub max_command_bytes: usize,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            socket: default_socket(),
            tcp: None,
            allowed_commands: Vec::new(),
            max_command_bytes: default_max_command_bytes(),
            drain_timeout_ms: default_drain_timeout_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

fn default_socket() -> String {
    DEFAULT_SOCKET_PATH.to_string()
}
fn default_max_command_bytes() -> usize {
    hrun_core::command::DEFAULT_MAX_COMMAND_BYTES
}
fn default_drain_timeout_ms() -> u64 {
    500
}
fn default_shutdown_grace_secs() -> u64 {
    5
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub socket: Option<String>,
    pub tcp: Option<String>,
    /// Replaces the file's list when non-empty.
    pub allowed_commands: Vec<String>,
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub endpoint: Endpoint,
    pub allowed_commands: Vec<String>,
    pub max_command_bytes: usize,
    pub drain_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl ServerConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    ///
    /// A missing file means defaults; one that fails to parse is an error.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> HrunResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse_config(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file_config.server, cli)
    }

    fn resolve(file: ServerSection, cli: CliOverrides) -> HrunResult<Self> {
        // Flags beat the file; within each source TCP beats the socket path.
        let endpoint = match (cli.tcp, cli.socket, file.tcp) {
            (Some(addr), _, _) => Endpoint::parse(&format!("tcp:{addr}"))?,
            (None, Some(socket), _) => Endpoint::Unix(expand_tilde_str(&socket)),
            (None, None, Some(addr)) => Endpoint::parse(&format!("tcp:{addr}"))?,
            (None, None, None) => Endpoint::Unix(expand_tilde_str(&file.socket)),
        };
        if let Endpoint::Unix(path) = &endpoint {
            if path.as_os_str().is_empty() {
                return Err(HrunError::Config("socket path is empty".into()));
            }
        }

        let allowed_commands = if cli.allowed_commands.is_empty() {
            file.allowed_commands
        } else {
            cli.allowed_commands
        };

        if file.max_command_bytes == 0 {
            return Err(HrunError::Config(
                "max_command_bytes must be greater than zero".into(),
            ));
        }

        Ok(Self {
            endpoint,
            allowed_commands,
            max_command_bytes: file.max_command_bytes,
            drain_timeout: Duration::from_millis(file.drain_timeout_ms),
            shutdown_grace: Duration::from_secs(file.shutdown_grace_secs),
        })
    }
}

fn parse_config(content: &str) -> HrunResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| HrunError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
