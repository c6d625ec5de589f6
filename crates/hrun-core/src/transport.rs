//! Stream transports for hrun.
//!
//! Sessions only need a bidirectional byte stream. Both Unix domain sockets
//! and TCP satisfy [`Connection`]; which one is used is decided by the
//! [`Endpoint`] given on the command line or in the config file.

use crate::error::{HrunError, HrunResult};
use std::fmt;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tracing::{debug, info, warn};

/// Default Unix socket path for the server.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/hrun.sock";

/// A bidirectional byte stream a session can run over.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Where the server listens and the client connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(String),
}

impl Endpoint {
    /// Parse `unix:<path>`, `tcp:<host:port>`, or a bare socket path.
    pub fn parse(s: &str) -> HrunResult<Self> {
        let endpoint = if let Some(path) = s.strip_prefix("unix:") {
            Endpoint::Unix(PathBuf::from(path))
        } else if let Some(addr) = s.strip_prefix("tcp:") {
            Endpoint::Tcp(addr.to_string())
        } else {
            Endpoint::Unix(PathBuf::from(s))
        };

        match &endpoint {
            Endpoint::Unix(path) if path.as_os_str().is_empty() => {
                Err(HrunError::Transport("empty socket path".into()))
            }
            Endpoint::Tcp(addr) if !addr.contains(':') => Err(HrunError::Transport(format!(
                "TCP endpoint must be host:port, got {addr:?}"
            ))),
            _ => Ok(endpoint),
        }
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint::Unix(PathBuf::from(DEFAULT_SOCKET_PATH))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp:{addr}"),
        }
    }
}

/// A bound listener. A Unix socket file is removed again on drop.
pub enum Listener {
    Unix { listener: UnixListener, path: PathBuf },
    Tcp(TcpListener),
}

impl Listener {
    /// Bind to `endpoint`, clearing a stale Unix socket file first.
    pub async fn bind(endpoint: &Endpoint) -> HrunResult<Self> {
        match endpoint {
            Endpoint::Unix(path) => {
                clear_stale_socket(path).await?;
                let listener = UnixListener::bind(path).map_err(|e| {
                    HrunError::Transport(format!("bind {} failed: {e}", path.display()))
                })?;
                info!(path = %path.display(), "Unix socket listener started");
                Ok(Listener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(addr.as_str())
                    .await
                    .map_err(|e| HrunError::Transport(format!("bind {addr} failed: {e}")))?;
                info!(addr = %addr, "TCP listener started");
                Ok(Listener::Tcp(listener))
            }
        }
    }

    /// Accept the next connection, with a printable peer description.
    pub async fn accept(&self) -> HrunResult<(Box<dyn Connection>, String)> {
        match self {
            Listener::Unix { listener, .. } => {
                let (stream, _addr) = listener.accept().await?;
                let peer = match stream.peer_cred() {
                    Ok(cred) => format!("pid={:?} uid={}", cred.pid(), cred.uid()),
                    Err(_) => "unix".to_string(),
                };
                Ok((Box::new(stream), peer))
            }
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(error = %e, "set_nodelay failed");
                }
                Ok((Box::new(stream), addr.to_string()))
            }
        }
    }

    /// The endpoint this listener is actually bound to.
    pub fn local_endpoint(&self) -> HrunResult<Endpoint> {
        match self {
            Listener::Unix { path, .. } => Ok(Endpoint::Unix(path.clone())),
            Listener::Tcp(listener) => Ok(Endpoint::Tcp(listener.local_addr()?.to_string())),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix { path, .. } = self {
            if let Err(e) = std::fs::remove_file(&*path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "could not remove socket file");
                }
            }
        }
    }
}

/// Remove `path` if it is a socket nobody is accepting on.
///
/// Anything at `path` that is not a socket is left alone and refused.
async fn clear_stale_socket(path: &Path) -> HrunResult<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if !metadata.file_type().is_socket() {
        return Err(HrunError::Transport(format!(
            "{} exists and is not a socket",
            path.display()
        )));
    }
    if UnixStream::connect(path).await.is_ok() {
        return Err(HrunError::Transport(format!(
            "address in use: {} has a live listener",
            path.display()
        )));
    }
    debug!(path = %path.display(), "removing stale socket file");
    std::fs::remove_file(path)?;
    Ok(())
}

/// Open a client connection to `endpoint`.
pub async fn connect(endpoint: &Endpoint) -> HrunResult<Box<dyn Connection>> {
    match endpoint {
        Endpoint::Unix(path) => {
            let stream = UnixStream::connect(path).await.map_err(|e| {
                HrunError::Transport(format!("connect {} failed: {e}", path.display()))
            })?;
            Ok(Box::new(stream))
        }
        Endpoint::Tcp(addr) => {
            let stream = TcpStream::connect(addr.as_str())
                .await
                .map_err(|e| HrunError::Transport(format!("connect {addr} failed: {e}")))?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
    }
}
