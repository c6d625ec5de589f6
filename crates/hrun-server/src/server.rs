//! Core server: accepts connections and runs one session relay per connection.
//!
//! Owns the allow-list, the PTY manager and the session tracker. Shutdown
//! stops accepting first; in-flight sessions then get a grace period to
//! drain through their own cancellation tokens.

use crate::auth::AllowList;
use crate::config::ServerConfig;
use crate::session::{PtyManager, RelaySettings, SessionRelay};
use hrun_core::{HrunResult, Listener};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Pause after a failed accept so a persistent error (e.g. EMFILE) does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// The hrun server instance.
pub struct HrunServer {
    relay: SessionRelay,
    shutdown_grace: Duration,
    /// Source of per-session ids.
    next_session_id: AtomicU64,
    sessions: TaskTracker,
}

impl HrunServer {
    pub fn new(config: &ServerConfig) -> Self {
        let allow_list = AllowList::new(config.allowed_commands.iter().cloned());
        if allow_list.is_restricted() {
            info!(commands = ?allow_list.commands(), "allow-list active");
        } else {
            warn!("no allow-list configured, any command may be run");
        }
        let settings = RelaySettings {
            max_command_bytes: config.max_command_bytes,
            drain_timeout: config.drain_timeout,
        };
        Self {
            relay: SessionRelay::new(Arc::new(allow_list), PtyManager::new(), settings),
            shutdown_grace: config.shutdown_grace,
            next_session_id: AtomicU64::new(1),
            sessions: TaskTracker::new(),
        }
    }

    pub fn ptys(&self) -> &PtyManager {
        self.relay.ptys()
    }

    /// Number of sessions currently running.
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Accept until `shutdown` fires, then wait for sessions to drain.
    pub async fn run(&self, listener: Listener, shutdown: CancellationToken) -> HrunResult<()> {
        info!(endpoint = %listener.local_endpoint()?, "hrun-server ready");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((conn, peer)) => {
                        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
                        debug!(session_id = id, peer = %peer, "connection accepted");
                        let relay = self.relay.clone();
                        let session_shutdown = shutdown.child_token();
                        self.sessions.spawn(async move {
                            // Outcome and errors are logged inside the session span.
                            let _ = relay.run(id, conn, session_shutdown).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        // Stop accepting before waiting on sessions.
        drop(listener);
        self.sessions.close();
        let active = self.sessions.len();
        info!(active, "shutting down, draining sessions");
        if tokio::time::timeout(self.shutdown_grace, self.sessions.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = self.sessions.len(),
                "shutdown grace period elapsed with sessions still open"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CliOverrides, ServerConfig};
    use hrun_core::{connect, encode_command, CommandRequest, Endpoint};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const TEST_TIMEOUT: Duration = Duration::from_secs(10);

    fn config(allowed: &[&str]) -> ServerConfig {
        let mut config = ServerConfig::load(None, CliOverrides::default()).unwrap();
        config.allowed_commands = allowed.iter().map(|s| s.to_string()).collect();
        config.shutdown_grace = Duration::from_secs(5);
        config
    }

    fn record(argv: &[&str]) -> Vec<u8> {
        let request =
            CommandRequest::new(argv.iter().map(|s| s.to_string()).collect(), 80, 24).unwrap();
        encode_command(&request).unwrap()
    }

    async fn start(
        allowed: &[&str],
    ) -> (
        Arc<HrunServer>,
        Endpoint,
        CancellationToken,
        tokio::task::JoinHandle<HrunResult<()>>,
        tempfile::TempDir,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::Unix(dir.path().join("hrun.sock"));
        let listener = Listener::bind(&endpoint).await.unwrap();
        let server = Arc::new(HrunServer::new(&config(allowed)));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn({
            let server = server.clone();
            let shutdown = shutdown.clone();
            async move { server.run(listener, shutdown).await }
        });
        (server, endpoint, shutdown, handle, dir)
    }

    async fn run_command(endpoint: &Endpoint, argv: &[&str]) -> String {
        let mut conn = connect(endpoint).await.unwrap();
        conn.write_all(&record(argv)).await.unwrap();
        let mut output = Vec::new();
        tokio::time::timeout(TEST_TIMEOUT, conn.read_to_end(&mut output))
            .await
            .unwrap()
            .unwrap();
        String::from_utf8_lossy(&output).into_owned()
    }

    #[tokio::test]
    async fn serves_sessions_concurrently() {
        let (server, endpoint, shutdown, handle, _dir) = start(&[]).await;

        let (a, b) = tokio::join!(
            run_command(&endpoint, &["echo", "first-session"]),
            run_command(&endpoint, &["echo", "second-session"]),
        );
        assert!(a.contains("first-session") && !a.contains("second-session"));
        assert!(b.contains("second-session") && !b.contains("first-session"));

        shutdown.cancel();
        tokio::time::timeout(TEST_TIMEOUT, handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(server.ptys().open_pairs(), 0);
    }

    #[tokio::test]
    async fn rejected_session_does_not_affect_others() {
        let (server, endpoint, shutdown, handle, _dir) = start(&["echo"]).await;

        assert_eq!(run_command(&endpoint, &["rm", "-rf", "/"]).await, "");
        assert!(run_command(&endpoint, &["echo", "still-serving"])
            .await
            .contains("still-serving"));

        shutdown.cancel();
        tokio::time::timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap().unwrap();
        assert_eq!(server.ptys().open_pairs(), 0);
    }

    #[tokio::test]
    async fn shutdown_drains_running_sessions() {
        let (server, endpoint, shutdown, handle, _dir) = start(&[]).await;

        let mut conn = connect(&endpoint).await.unwrap();
        conn.write_all(&record(&["sleep", "100"])).await.unwrap();
        // Wait for the session to get its PTY.
        let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
        while server.ptys().open_pairs() == 0 {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(server.active_sessions(), 1);

        shutdown.cancel();
        tokio::time::timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap().unwrap();
        assert_eq!(server.active_sessions(), 0);
        assert_eq!(server.ptys().open_pairs(), 0);

        let mut rest = Vec::new();
        conn.read_to_end(&mut rest).await.unwrap();
        // New connections are refused once the listener is gone.
        assert!(connect(&endpoint).await.is_err());
    }
}
