//! Child process supervision.
//!
//! The child becomes a session leader with the PTY subordinate as its
//! controlling terminal, so its PID is also its process-group ID. Forced
//! termination always targets that whole group, which reaches anything an
//! interactive shell started in the background.

use hrun_core::{HrunError, HrunResult};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::io;
use std::os::fd::OwnedFd;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// `TERM` given to children when the server itself has none.
const DEFAULT_TERM: &str = "xterm-256color";

/// A spawned child and its process group.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pgid: Pid,
    status: Option<ExitStatus>,
}

/// Launch `argv[0]` with `argv[1..]` on the given PTY subordinate.
///
/// The child gets its own session, the subordinate as controlling terminal
/// and stdio, and (on Linux) SIGTERM if the server dies first.
pub fn spawn(argv: &[String], subordinate: &OwnedFd) -> HrunResult<ProcessHandle> {
    let (program, args) = argv.split_first().ok_or(HrunError::EmptyCommand)?;

    let stdio = |fd: &OwnedFd| -> HrunResult<Stdio> {
        fd.try_clone()
            .map(Stdio::from)
            .map_err(|e| HrunError::SpawnFailed(format!("dup PTY subordinate: {e}")))
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(stdio(subordinate)?)
        .stdout(stdio(subordinate)?)
        .stderr(stdio(subordinate)?)
        .kill_on_drop(true);
    if std::env::var_os("TERM").is_none() {
        cmd.env("TERM", DEFAULT_TERM);
    }

    // SAFETY: the hook runs between fork and exec and only makes
    // async-signal-safe calls (setsid, ioctl, prctl). Stdio is already
    // redirected to the subordinate at this point.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid()?;
            if libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY as _, 0) == -1 {
                return Err(io::Error::last_os_error());
            }
            #[cfg(target_os = "linux")]
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM as libc::c_ulong) == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = cmd
        .spawn()
        .map_err(|e| HrunError::SpawnFailed(format!("{program}: {e}")))?;
    let pid = child
        .id()
        .ok_or_else(|| HrunError::SpawnFailed(format!("{program}: exited before start")))?;
    let pgid = Pid::from_raw(pid as i32);

    info!(pid, program = %program, "child spawned");
    Ok(ProcessHandle {
        child,
        pgid,
        status: None,
    })
}

impl ProcessHandle {
    /// Leader PID, which is also the process-group ID.
    pub fn pid(&self) -> i32 {
        self.pgid.as_raw()
    }

    /// Exit status, if the child has been reaped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.status
    }

    /// Wait for the child to exit and reap it.
    ///
    /// Cancel-safe, and returns the cached status when called again.
    pub async fn wait(&mut self) -> HrunResult<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| HrunError::Other(format!("wait for pid {}: {e}", self.pgid)))?;
        self.status = Some(status);
        info!(pid = self.pid(), %status, "child exited");
        Ok(status)
    }

    /// SIGKILL the whole process group. A group that is already gone is
    /// not an error.
    pub fn terminate(&self) -> HrunResult<()> {
        match killpg(self.pgid, Signal::SIGKILL) {
            Ok(()) => {
                debug!(pgid = self.pid(), "process group killed");
                Ok(())
            }
            Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(HrunError::Other(format!(
                "kill process group {}: {e}",
                self.pgid
            ))),
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.status.is_none() {
            if let Err(e) = self.terminate() {
                warn!(error = %e, "failed to kill unreaped process group");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::pty::PtyManager;
    use std::os::unix::process::ExitStatusExt;
    use std::time::Duration;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn spawn_and_wait() {
        let ptys = PtyManager::new();
        let pair = ptys.open().unwrap();
        let mut child = spawn(&argv(&["true"]), pair.subordinate().unwrap()).unwrap();
        assert!(child.pid() > 0);

        let status = child.wait().await.unwrap();
        assert!(status.success());
        // Second wait returns the cached status.
        assert_eq!(child.wait().await.unwrap(), status);
        assert_eq!(child.exit_status(), Some(status));
        // Killing an exited child is a no-op.
        child.terminate().unwrap();
    }

    #[tokio::test]
    async fn missing_executable_fails_to_spawn() {
        let ptys = PtyManager::new();
        let pair = ptys.open().unwrap();
        let err = spawn(&argv(&["/nonexistent/hrun-test-binary"]), pair.subordinate().unwrap())
            .unwrap_err();
        assert!(matches!(err, HrunError::SpawnFailed(_)));
    }

    #[tokio::test]
    async fn empty_argv_is_rejected() {
        let ptys = PtyManager::new();
        let pair = ptys.open().unwrap();
        let err = spawn(&[], pair.subordinate().unwrap()).unwrap_err();
        assert!(matches!(err, HrunError::EmptyCommand));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn child_leads_session_on_the_pty() {
        let ptys = PtyManager::new();
        let mut pair = ptys.open().unwrap();
        let controller = pair.controller().unwrap();
        let mut child = spawn(
            &argv(&[
                "sh",
                "-c",
                "test -t 0 || exit 3; echo sid=$(cut -d' ' -f6 /proc/$$/stat) pid=$$",
            ]),
            pair.subordinate().unwrap(),
        )
        .unwrap();
        pair.release_subordinate();

        let mut output = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            let n = tokio::time::timeout(Duration::from_secs(5), controller.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            if n == 0 {
                break;
            }
            output.extend_from_slice(&buf[..n]);
        }
        let status = child.wait().await.unwrap();
        assert!(status.success(), "stdin was not a terminal");

        let text = String::from_utf8_lossy(&output);
        let pid = child.pid();
        assert!(text.contains(&format!("sid={pid} pid={pid}")), "{text}");
    }

    #[tokio::test]
    async fn terminate_kills_leader() {
        let ptys = PtyManager::new();
        let pair = ptys.open().unwrap();
        let mut child = spawn(&argv(&["sleep", "100"]), pair.subordinate().unwrap()).unwrap();

        child.terminate().unwrap();
        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.signal(), Some(libc::SIGKILL));
        // Repeated termination stays quiet.
        child.terminate().unwrap();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn terminate_reaches_background_descendants() {
        let ptys = PtyManager::new();
        let pair = ptys.open().unwrap();
        let controller = pair.controller().unwrap();
        let mut child = spawn(
            &argv(&["sh", "-c", "sleep 100 & echo bg=$!; wait"]),
            pair.subordinate().unwrap(),
        )
        .unwrap();

        let mut output = String::new();
        let mut buf = [0u8; 256];
        let bg_pid: i32 = loop {
            let n = tokio::time::timeout(Duration::from_secs(5), controller.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert!(n > 0, "shell exited early: {output}");
            output.push_str(&String::from_utf8_lossy(&buf[..n]));
            if let Some(rest) = output.split("bg=").nth(1) {
                let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
                if rest.len() > digits.len() && !digits.is_empty() {
                    break digits.parse().unwrap();
                }
            }
        };

        child.terminate().unwrap();
        child.wait().await.unwrap();

        // The background sleep is gone (or a zombie awaiting its reaper).
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            match std::fs::read_to_string(format!("/proc/{bg_pid}/stat")) {
                Err(_) => break,
                Ok(stat) if stat.rsplit(')').next().unwrap().trim_start().starts_with('Z') => break,
                Ok(_) => {}
            }
            assert!(tokio::time::Instant::now() < deadline, "pid {bg_pid} survived");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
