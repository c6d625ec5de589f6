//! Client configuration at `~/.hrun/config.toml`.
//!
//! Only says where the server listens. CLI flags always override config
//! file values.

use anyhow::{Context, Result};
use hrun_core::transport::DEFAULT_SOCKET_PATH;
use hrun_core::Endpoint;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub client: ClientConfig,
}

/// `[client]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Unix socket of the server.
    #[serde(default = "default_socket")]
    pub socket: String,

    /// `host:port` of a TCP server; preferred over `socket` when set.
    #[serde(default)]
    pub tcp: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket: default_socket(),
            tcp: None,
        }
    }
}

fn default_socket() -> String {
    DEFAULT_SOCKET_PATH.to_string()
}

impl Config {
    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Pick the server endpoint: `--tcp`, then `--socket`, then the file.
    pub fn endpoint(&self, cli_socket: Option<&str>, cli_tcp: Option<&str>) -> Result<Endpoint> {
        let endpoint = match (cli_tcp, cli_socket, self.client.tcp.as_deref()) {
            (Some(addr), _, _) | (None, None, Some(addr)) => {
                Endpoint::parse(&format!("tcp:{addr}"))?
            }
            (None, Some(socket), _) => Endpoint::Unix(expand_tilde(socket)),
            (None, None, None) => Endpoint::Unix(expand_tilde(&self.client.socket)),
        };
        Ok(endpoint)
    }
}

/// Default config location, `~/.hrun/config.toml`.
pub fn default_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".hrun")
        .join("config.toml")
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_tilde(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.client.socket, "/tmp/hrun.sock");
        assert!(cfg.client.tcp.is_none());
        assert_eq!(cfg.endpoint(None, None).unwrap(), Endpoint::default());
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[client]
socket = "/run/hrun.sock"
tcp = "10.0.0.2:7000"
"#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.client.socket, "/run/hrun.sock");
        assert_eq!(
            cfg.endpoint(None, None).unwrap(),
            Endpoint::Tcp("10.0.0.2:7000".into())
        );
    }

    #[test]
    fn flags_override_file() {
        let cfg: Config = toml::from_str("[client]\ntcp = \"10.0.0.2:7000\"\n").unwrap();
        assert_eq!(
            cfg.endpoint(Some("/tmp/flag.sock"), None).unwrap(),
            Endpoint::Unix(PathBuf::from("/tmp/flag.sock"))
        );
        assert_eq!(
            cfg.endpoint(Some("/tmp/flag.sock"), Some("127.0.0.1:1")).unwrap(),
            Endpoint::Tcp("127.0.0.1:1".into())
        );
        assert!(cfg.endpoint(None, Some("no-port")).is_err());
    }

    #[test]
    fn load_missing_and_present_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        assert!(Config::load(&path).unwrap().client.tcp.is_none());

        std::fs::write(&path, "[client]\nsocket = \"/srv/hrun.sock\"\n").unwrap();
        assert_eq!(Config::load(&path).unwrap().client.socket, "/srv/hrun.sock");

        std::fs::write(&path, "[client\n").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
