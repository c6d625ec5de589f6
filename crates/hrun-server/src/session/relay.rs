//! Session relay: drives one connection from command record to teardown.
//!
//! ```text
//! AwaitingCommand ─► Allowed ─► Running ─► Draining ─► Closed
//!        └───────────────┴── (any command-stage error) ──► Closed
//! ```
//!
//! While running, three tasks share the session:
//!
//! - inbound: connection → [`ControlScanner`] → PTY, handing control records
//!   to the control task,
//! - outbound: PTY → connection,
//! - control: applies `resize:` records to the PTY.
//!
//! The first of child exit, a relay failure or the shutdown token starts
//! draining. When the client half-closes or the terminal reaches
//! end-of-stream, the child gets `drain_timeout` to exit before the session
//! is treated as closed by the connection. Every teardown step tolerates
//! having already happened.

use super::process::{self, ProcessHandle};
use super::pty::{PtyController, PtyManager};
use crate::auth::AllowList;
use hrun_core::command::{read_command, DEFAULT_MAX_COMMAND_BYTES};
use hrun_core::{Connection, ControlScanner, HrunError, HrunResult, Resize, ScanItem};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

/// Read buffer size for both relay directions.
const RELAY_BUFFER_SIZE: usize = 8 * 1024;

/// Control records queued between the inbound pump and the control task.
const CONTROL_QUEUE_DEPTH: usize = 16;

/// How long a possible record prefix may sit unfinished before it is
/// forwarded as ordinary input.
const PARTIAL_RECORD_WAIT: Duration = Duration::from_millis(50);

/// Per-session knobs, taken from the server config.
#[derive(Debug, Clone, Copy)]
pub struct RelaySettings {
    /// Upper bound on the command record, newline included.
    pub max_command_bytes: usize,
    /// How long to keep forwarding output after the child exits.
    pub drain_timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            max_command_bytes: DEFAULT_MAX_COMMAND_BYTES,
            drain_timeout: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingCommand,
    Allowed,
    Running,
    Draining,
    Closed,
}

/// What ended the running phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainReason {
    ChildExited,
    ConnectionClosed,
    Shutdown,
}

/// Result of a session that reached `Running`.
#[derive(Debug, Clone, Copy)]
pub struct SessionOutcome {
    pub reason: DrainReason,
    /// `None` only if reaping the child failed.
    pub exit_status: Option<ExitStatus>,
}

/// Lifecycle bookkeeping for one connection.
#[derive(Debug)]
struct Session {
    id: u64,
    state: SessionState,
}

impl Session {
    fn new(id: u64) -> Self {
        Self {
            id,
            state: SessionState::AwaitingCommand,
        }
    }

    fn enter(&mut self, next: SessionState) {
        if self.state != next {
            debug!(session_id = self.id, from = ?self.state, to = ?next, "session state");
            self.state = next;
        }
    }
}

/// Runs sessions. Cheap to clone; one instance is shared by the acceptor.
#[derive(Debug, Clone)]
pub struct SessionRelay {
    allow_list: Arc<AllowList>,
    ptys: PtyManager,
    settings: RelaySettings,
}

impl SessionRelay {
    pub fn new(allow_list: Arc<AllowList>, ptys: PtyManager, settings: RelaySettings) -> Self {
        Self {
            allow_list,
            ptys,
            settings,
        }
    }

    pub fn ptys(&self) -> &PtyManager {
        &self.ptys
    }

    /// Run one session to completion.
    ///
    /// Command-stage failures come back as `Err` after the connection has
    /// been dropped; nothing is sent to the client about them.
    pub async fn run<C: Connection>(
        &self,
        id: u64,
        conn: C,
        shutdown: CancellationToken,
    ) -> HrunResult<SessionOutcome> {
        let span = info_span!("session", id);
        async move {
            let mut session = Session::new(id);
            let result = self.drive(&mut session, conn, &shutdown).await;
            session.enter(SessionState::Closed);
            match &result {
                Ok(outcome) => info!(
                    reason = ?outcome.reason,
                    status = ?outcome.exit_status,
                    "session closed"
                ),
                Err(e) if e.is_command_stage() => warn!(error = %e, "session rejected"),
                Err(e) => warn!(error = %e, "session failed"),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn drive<C: Connection>(
        &self,
        session: &mut Session,
        conn: C,
        shutdown: &CancellationToken,
    ) -> HrunResult<SessionOutcome> {
        let (read_half, write_half) = tokio::io::split(conn);
        // Everything after the command record is read through this same
        // buffer, so bytes sent early are not lost.
        let mut reader = BufReader::new(read_half);

        let request = tokio::select! {
            result = read_command(&mut reader, self.settings.max_command_bytes) => result?,
            _ = shutdown.cancelled() => {
                return Err(HrunError::Other("shutdown before command record".into()));
            }
        };
        info!(
            argv = ?request.argv,
            cols = request.width,
            rows = request.height,
            "command received"
        );

        self.allow_list.check(request.program())?;
        session.enter(SessionState::Allowed);

        let mut pty = self.ptys.open()?;
        if let Err(e) = pty.resize(request.width, request.height) {
            warn!(error = %e, "initial resize failed, keeping default geometry");
        }
        let spawned = process::spawn(&request.argv, pty.subordinate()?);
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                pty.close();
                return Err(e);
            }
        };
        pty.release_subordinate();
        let controller = pty.controller()?;
        session.enter(SessionState::Running);

        let relay_done = CancellationToken::new();
        let input_eof = CancellationToken::new();
        let pty_eof = CancellationToken::new();
        let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE_DEPTH);
        let tasks = [
            spawn_task(pump_inbound(
                reader,
                controller.clone(),
                control_tx,
                input_eof.clone(),
                relay_done.clone(),
            )),
            spawn_task(pump_outbound(
                controller.clone(),
                write_half,
                pty_eof.clone(),
                relay_done.clone(),
            )),
            spawn_task(apply_control(control_rx, controller)),
        ];

        // `None`: one direction ended cleanly and the child has the last word.
        let trigger = tokio::select! {
            biased;
            _ = shutdown.cancelled() => Some(DrainReason::Shutdown),
            status = child.wait() => {
                if let Err(e) = status {
                    warn!(error = %e, "waiting for child failed");
                }
                Some(DrainReason::ChildExited)
            }
            _ = pty_eof.cancelled() => None,
            _ = input_eof.cancelled() => None,
            _ = relay_done.cancelled() => Some(DrainReason::ConnectionClosed),
        };
        let reason = match trigger {
            Some(reason) => reason,
            None => self.await_child(&mut child, shutdown).await,
        };
        session.enter(SessionState::Draining);
        debug!(reason = ?reason, "draining");

        let exit_status = self.drain(reason, &mut child, &relay_done).await;
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "relay task panicked");
            }
        }
        pty.close();

        Ok(SessionOutcome {
            reason,
            exit_status,
        })
    }

    /// Give the child `drain_timeout` to exit on its own after the terminal
    /// closed or the client stopped sending.
    async fn await_child(
        &self,
        child: &mut ProcessHandle,
        shutdown: &CancellationToken,
    ) -> DrainReason {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => DrainReason::Shutdown,
            exited = tokio::time::timeout(self.settings.drain_timeout, child.wait()) => {
                match exited {
                    Ok(_) => DrainReason::ChildExited,
                    Err(_) => {
                        debug!("child still running after its input or terminal ended");
                        DrainReason::ConnectionClosed
                    }
                }
            }
        }
    }

    /// Kill what is left of the child's group, let pending output through,
    /// stop the relay tasks, and reap the child.
    async fn drain(
        &self,
        reason: DrainReason,
        child: &mut ProcessHandle,
        relay_done: &CancellationToken,
    ) -> Option<ExitStatus> {
        if let Err(e) = child.terminate() {
            warn!(error = %e, "terminate failed");
        }

        if reason == DrainReason::ChildExited
            && tokio::time::timeout(self.settings.drain_timeout, relay_done.cancelled())
                .await
                .is_err()
        {
            debug!("drain timeout elapsed with output still pending");
        }
        relay_done.cancel();

        match child.wait().await {
            Ok(status) => Some(status),
            Err(e) => {
                warn!(error = %e, "failed to reap child");
                None
            }
        }
    }
}

fn spawn_task<F>(fut: F) -> JoinHandle<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(fut.in_current_span())
}

/// How the inbound pump stopped.
#[derive(Debug)]
enum InboundEnd {
    /// The client half-closed or hung up.
    PeerClosed,
    /// Another part of the session ended the relay.
    Stopped,
    Failed(std::io::Error),
}

/// Connection → PTY, diverting control records.
///
/// A clean end of the connection is passed on to the terminal as its
/// end-of-file character and reported through `input_eof`; anything else
/// ends the whole relay.
async fn pump_inbound<R>(
    mut reader: R,
    controller: PtyController,
    control_tx: mpsc::Sender<String>,
    input_eof: CancellationToken,
    done: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut scanner = ControlScanner::new();
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut forwarded: u64 = 0;
    let mut at_line_start = true;

    let end = 'relay: loop {
        let read = tokio::select! {
            read = reader.read(&mut buf) => Some(read),
            _ = tokio::time::sleep(PARTIAL_RECORD_WAIT), if scanner.pending() > 0 => None,
            _ = done.cancelled() => break 'relay InboundEnd::Stopped,
        };
        let items = match read {
            Some(Ok(0)) => break 'relay InboundEnd::PeerClosed,
            Some(Ok(n)) => scanner.feed(&buf[..n]),
            Some(Err(e)) => break 'relay InboundEnd::Failed(e),
            // Held bytes that go quiet are keystrokes, not a record.
            None => scanner
                .flush_partial()
                .map(ScanItem::Payload)
                .into_iter()
                .collect(),
        };

        for item in items {
            match item {
                ScanItem::Payload(bytes) => {
                    tokio::select! {
                        written = controller.write_all(&bytes) => {
                            if let Err(e) = written {
                                break 'relay InboundEnd::Failed(e);
                            }
                            forwarded += bytes.len() as u64;
                            if let Some(&last) = bytes.last() {
                                at_line_start = matches!(last, b'\n' | b'\r');
                            }
                        }
                        _ = done.cancelled() => break 'relay InboundEnd::Stopped,
                    }
                }
                ScanItem::Control(body) => {
                    if control_tx.send(body).await.is_err() {
                        debug!("control task gone, dropping record");
                    }
                }
            }
        }
    };

    match end {
        InboundEnd::PeerClosed => {
            let mut tail = scanner.finish().unwrap_or_default();
            if let Some(&last) = tail.last() {
                at_line_start = matches!(last, b'\n' | b'\r');
            }
            // Mid-line, the first EOF only pushes the pending line through.
            let eof = controller.eof_char();
            tail.push(eof);
            if !at_line_start {
                tail.push(eof);
            }
            if let Err(e) = controller.write_all(&tail).await {
                debug!(error = %e, "could not pass end-of-file to the terminal");
            }
            debug!(bytes = forwarded, "client closed its side of the connection");
            input_eof.cancel();
        }
        InboundEnd::Stopped => {
            debug!(bytes = forwarded, "inbound relay finished");
            done.cancel();
        }
        InboundEnd::Failed(e) => {
            warn!(error = %HrunError::from(e), "inbound relay failed");
            done.cancel();
        }
    }
}

/// PTY → connection. Half-closes the connection when done.
///
/// Terminal end-of-stream is reported through `pty_eof` before the
/// connection is closed.
async fn pump_outbound<W>(
    controller: PtyController,
    mut writer: W,
    pty_eof: CancellationToken,
    done: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut forwarded: u64 = 0;

    let result: std::io::Result<()> = loop {
        let n = tokio::select! {
            read = controller.read(&mut buf) => match read {
                Ok(0) => {
                    pty_eof.cancel();
                    break Ok(());
                }
                Ok(n) => n,
                Err(e) => {
                    pty_eof.cancel();
                    break Err(e);
                }
            },
            _ = done.cancelled() => break Ok(()),
        };
        tokio::select! {
            written = writer.write_all(&buf[..n]) => {
                if let Err(e) = written {
                    break Err(e);
                }
                forwarded += n as u64;
            }
            _ = done.cancelled() => break Ok(()),
        }
    };

    if let Err(e) = writer.shutdown().await {
        debug!(error = %e, "connection shutdown failed");
    }
    match result {
        Ok(()) => debug!(bytes = forwarded, "outbound relay finished"),
        Err(e) => warn!(error = %HrunError::from(e), "outbound relay failed"),
    }
    done.cancel();
}

/// Applies resize records until the inbound pump goes away.
async fn apply_control(mut control_rx: mpsc::Receiver<String>, controller: PtyController) {
    while let Some(body) = control_rx.recv().await {
        let resize = match Resize::parse_body(&body) {
            Ok(resize) => resize,
            Err(e) => {
                warn!(error = %e, "ignoring control record");
                continue;
            }
        };
        match controller.resize(resize.cols, resize.rows) {
            Ok(()) => info!(cols = resize.cols, rows = resize.rows, "terminal resized"),
            Err(e) => warn!(error = %e, "keeping previous geometry"),
        }
    }
}
