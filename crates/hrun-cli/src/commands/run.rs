//! `hrun [command...]`: run a command on the host through hrun-server.
//!
//! Connects, sends the command record with the local terminal size, puts the
//! local terminal into raw mode and relays stdin/stdout until either side
//! closes. Window-size changes (SIGWINCH) are forwarded as `resize:` records.

use anyhow::{Context, Result};
use hrun_core::{connect, encode_command, CommandRequest, Endpoint, Resize};
use std::future::Future;
use std::io::Read;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::terminal as term;

const STDIN_CHUNK: usize = 4096;
const OUTPUT_BUFFER: usize = 8192;

/// Everything the client sends after the command record. Stdin data and
/// resize records share one queue so a record never lands inside a chunk.
#[derive(Debug, PartialEq, Eq)]
enum Outbound {
    Input(Vec<u8>),
    Resize(Resize),
    InputClosed,
}

/// Run `argv` on the host behind `endpoint`.
pub async fn run(endpoint: &Endpoint, argv: Vec<String>) -> Result<()> {
    let interactive = term::stdin_is_tty();
    let (cols, rows) = term::terminal_size();
    let record = command_record(argv, cols, rows)?;

    let conn = connect(endpoint)
        .await
        .with_context(|| format!("failed to connect to {endpoint}"))?;
    info!(endpoint = %endpoint, cols, rows, interactive, "connected");

    let (reader, mut writer) = tokio::io::split(conn);
    writer
        .write_all(&record)
        .await
        .context("failed to send command to the server")?;

    // Install handlers before raw mode so an early signal still restores it.
    let stop = termination_signal()?;
    let _guard = term::RawModeGuard::enter_if_tty()?;

    let (tx, rx) = mpsc::channel(64);
    spawn_stdin_reader(tx.clone())?;
    let resize_task = interactive.then(|| tokio::spawn(forward_resizes(tx)));

    let result = relay(reader, writer, rx, tokio::io::stdout(), interactive, stop).await;

    if let Some(task) = resize_task {
        task.abort();
    }
    info!("session closed");
    result
}

fn command_record(argv: Vec<String>, cols: u16, rows: u16) -> Result<Vec<u8>> {
    let request = CommandRequest::new(argv, cols, rows).context("no command to run")?;
    Ok(encode_command(&request)?)
}

/// Duplex copy between the connection and the local terminal.
///
/// Ends when the server closes, when `stop` fires, or (interactive only)
/// when stdin hits end-of-file. With a non-terminal stdin, end-of-file
/// half-closes the connection and output keeps flowing until the server
/// is done.
async fn relay<R, W, O, S>(
    mut reader: R,
    mut writer: W,
    mut outbound: mpsc::Receiver<Outbound>,
    mut output: O,
    interactive: bool,
    stop: S,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    O: AsyncWrite + Unpin,
    S: Future<Output = ()>,
{
    let downstream = async {
        let mut buf = vec![0u8; OUTPUT_BUFFER];
        loop {
            let n = reader
                .read(&mut buf)
                .await
                .context("failed to read from the server")?;
            if n == 0 {
                return anyhow::Ok(());
            }
            output.write_all(&buf[..n]).await?;
            output.flush().await?;
        }
    };

    let upstream = async {
        while let Some(item) = outbound.recv().await {
            match item {
                Outbound::Input(bytes) => writer
                    .write_all(&bytes)
                    .await
                    .context("failed to send input to the server")?,
                Outbound::Resize(resize) => {
                    debug!(cols = resize.cols, rows = resize.rows, "terminal resized");
                    writer
                        .write_all(&resize.encode())
                        .await
                        .context("failed to send resize to the server")?;
                }
                Outbound::InputClosed if interactive => return anyhow::Ok(()),
                Outbound::InputClosed => {
                    debug!("stdin closed, half-closing the connection");
                    writer
                        .shutdown()
                        .await
                        .context("failed to close the connection for writing")?;
                    break;
                }
            }
        }
        // Nothing more to send; the server decides when the session ends.
        std::future::pending::<Result<()>>().await
    };

    tokio::select! {
        result = downstream => {
            debug!("server closed the session");
            result
        }
        result = upstream => {
            debug!("local input finished");
            result
        }
        _ = stop => {
            info!("terminated by signal");
            Ok(())
        }
    }
}

/// Read stdin on its own OS thread; a blocked read must not hold up exit.
fn spawn_stdin_reader(tx: mpsc::Sender<Outbound>) -> Result<()> {
    std::thread::Builder::new()
        .name("hrun-stdin".into())
        .spawn(move || {
            let mut stdin = std::io::stdin().lock();
            let mut buf = [0u8; STDIN_CHUNK];
            loop {
                match stdin.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(Outbound::Input(buf[..n].to_vec())).is_err() {
                            return;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!(error = %e, "stdin read failed");
                        break;
                    }
                }
            }
            let _ = tx.blocking_send(Outbound::InputClosed);
        })
        .context("failed to start stdin reader")?;
    Ok(())
}

/// Queue a resize record on every SIGWINCH.
async fn forward_resizes(tx: mpsc::Sender<Outbound>) {
    let mut winch = match signal(SignalKind::window_change()) {
        Ok(winch) => winch,
        Err(e) => {
            warn!(error = %e, "cannot watch window size changes");
            return;
        }
    };
    while winch.recv().await.is_some() {
        let (cols, rows) = term::terminal_size();
        if cols == 0 || rows == 0 {
            continue;
        }
        if tx.send(Outbound::Resize(Resize::new(cols, rows))).await.is_err() {
            break;
        }
    }
}

/// Resolves on SIGTERM, SIGHUP or SIGINT.
fn termination_signal() -> Result<impl Future<Output = ()>> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    Ok(async move {
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sighup.recv() => {}
            _ = sigint.recv() => {}
        }
    })
}
