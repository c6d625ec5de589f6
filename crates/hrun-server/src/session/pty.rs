//! PTY allocation and the async controller endpoint.
//!
//! A [`PtyPair`] is opened per session. The subordinate side is handed to the
//! child process; the controller side is wrapped in a tokio [`AsyncFd`] so
//! the relay tasks can read and write it without blocking threads.

use hrun_core::{HrunError, HrunResult};
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::pty::{openpty, Winsize};
use nix::sys::termios::{tcgetattr, SpecialCharacterIndices};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::unix::AsyncFd;
use tracing::debug;

nix::ioctl_write_ptr_bad!(set_window_size, libc::TIOCSWINSZ, Winsize);
nix::ioctl_read_bad!(get_window_size, libc::TIOCGWINSZ, Winsize);

const CTRL_D: u8 = 0x04;

/// Allocates PTY pairs and counts how many are currently open.
#[derive(Debug, Clone, Default)]
pub struct PtyManager {
    open_pairs: Arc<AtomicUsize>,
}

impl PtyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a controller/subordinate pair with the OS default geometry.
    pub fn open(&self) -> HrunResult<PtyPair> {
        let pty = openpty(None, None)
            .map_err(|e| HrunError::PtyAllocationFailed(format!("openpty: {e}")))?;

        for fd in [&pty.master, &pty.slave] {
            fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(|e| {
                HrunError::PtyAllocationFailed(format!("set close-on-exec: {e}"))
            })?;
        }
        let flags = fcntl(pty.master.as_raw_fd(), FcntlArg::F_GETFL)
            .map_err(|e| HrunError::PtyAllocationFailed(format!("get flags: {e}")))?;
        let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
        fcntl(pty.master.as_raw_fd(), FcntlArg::F_SETFL(flags))
            .map_err(|e| HrunError::PtyAllocationFailed(format!("set non-blocking: {e}")))?;

        let controller = AsyncFd::new(File::from(pty.master))
            .map_err(|e| HrunError::PtyAllocationFailed(format!("register with reactor: {e}")))?;

        let open = self.open_pairs.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(open_pairs = open, "PTY pair opened");

        Ok(PtyPair {
            controller: Some(PtyController {
                fd: Arc::new(controller),
            }),
            subordinate: Some(pty.slave),
            guard: Some(OpenPairGuard {
                counter: self.open_pairs.clone(),
            }),
        })
    }

    /// Number of pairs opened through this manager and not yet closed.
    pub fn open_pairs(&self) -> usize {
        self.open_pairs.load(Ordering::Relaxed)
    }
}

/// Decrements the manager's counter exactly once.
#[derive(Debug)]
struct OpenPairGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for OpenPairGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// One session's PTY. Closing is idempotent and also happens on drop.
#[derive(Debug)]
pub struct PtyPair {
    controller: Option<PtyController>,
    subordinate: Option<OwnedFd>,
    guard: Option<OpenPairGuard>,
}

impl PtyPair {
    /// A handle to the controller side, shareable across tasks.
    pub fn controller(&self) -> HrunResult<PtyController> {
        self.controller
            .clone()
            .ok_or_else(|| HrunError::Other("PTY pair already closed".into()))
    }

    /// The subordinate device, for binding to a child's stdio.
    pub fn subordinate(&self) -> HrunResult<&OwnedFd> {
        self.subordinate
            .as_ref()
            .ok_or_else(|| HrunError::Other("PTY subordinate already released".into()))
    }

    /// Drop our copy of the subordinate once the child holds its own.
    ///
    /// After this, controller reads hit end-of-stream as soon as every
    /// process using the terminal is gone.
    pub fn release_subordinate(&mut self) {
        self.subordinate.take();
    }

    pub fn resize(&self, cols: u16, rows: u16) -> HrunResult<()> {
        self.controller
            .as_ref()
            .ok_or_else(|| HrunError::ResizeFailed("PTY pair closed".into()))?
            .resize(cols, rows)
    }

    pub fn size(&self) -> HrunResult<(u16, u16)> {
        self.controller
            .as_ref()
            .ok_or_else(|| HrunError::Other("PTY pair closed".into()))?
            .size()
    }

    pub fn is_closed(&self) -> bool {
        self.guard.is_none()
    }

    /// Release both sides. A second call is a no-op.
    pub fn close(&mut self) {
        if self.guard.is_none() {
            return;
        }
        self.subordinate.take();
        self.controller.take();
        self.guard.take();
        debug!("PTY pair closed");
    }
}

impl Drop for PtyPair {
    fn drop(&mut self) {
        self.close();
    }
}

/// Async handle to the controller side of a PTY.
///
/// Clones share one descriptor; it is closed when the last clone drops.
#[derive(Debug, Clone)]
pub struct PtyController {
    fd: Arc<AsyncFd<File>>,
}

impl PtyController {
    /// Read terminal output. Returns 0 once no process holds the terminal.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| {
                let mut file: &File = inner.get_ref();
                file.read(buf)
            }) {
                Ok(Ok(n)) => return Ok(n),
                // Linux reports a hung-up subordinate as EIO.
                Ok(Err(e)) if e.raw_os_error() == Some(libc::EIO) => return Ok(0),
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }

    /// Write all of `data` as terminal input.
    pub async fn write_all(&self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| {
                let mut file: &File = inner.get_ref();
                file.write(data)
            }) {
                Ok(Ok(0)) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(Ok(n)) => data = &data[n..],
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    /// Apply a new window size; the foreground process group gets SIGWINCH.
    pub fn resize(&self, cols: u16, rows: u16) -> HrunResult<()> {
        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: TIOCSWINSZ reads one `winsize` from a valid pointer; the
        // descriptor stays open for the lifetime of `self`.
        unsafe { set_window_size(self.fd.get_ref().as_raw_fd(), &winsize) }
            .map_err(|e| HrunError::ResizeFailed(e.to_string()))?;
        debug!(cols, rows, "PTY resized");
        Ok(())
    }

    /// The terminal's end-of-file character (VEOF), `^D` if it cannot be read.
    pub fn eof_char(&self) -> u8 {
        match tcgetattr(self.fd.get_ref()) {
            Ok(termios) => termios.control_chars[SpecialCharacterIndices::VEOF as usize],
            Err(e) => {
                debug!(error = %e, "tcgetattr failed, assuming ^D");
                CTRL_D
            }
        }
    }

    /// Current geometry as `(cols, rows)`.
    pub fn size(&self) -> HrunResult<(u16, u16)> {
        let mut winsize = Winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: TIOCGWINSZ writes one `winsize` into a valid pointer.
        unsafe { get_window_size(self.fd.get_ref().as_raw_fd(), &mut winsize) }
            .map_err(|e| HrunError::Other(format!("TIOCGWINSZ: {e}")))?;
        Ok((winsize.ws_col, winsize.ws_row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;

    #[tokio::test]
    async fn open_resize_and_close() {
        let manager = PtyManager::new();
        let mut pair = manager.open().unwrap();
        assert_eq!(manager.open_pairs(), 1);

        pair.resize(120, 40).unwrap();
        assert_eq!(pair.size().unwrap(), (120, 40));
        // Idempotent.
        pair.resize(120, 40).unwrap();
        assert_eq!(pair.size().unwrap(), (120, 40));

        pair.close();
        assert!(pair.is_closed());
        assert_eq!(manager.open_pairs(), 0);
        pair.close();
        assert_eq!(manager.open_pairs(), 0);

        assert!(matches!(pair.resize(1, 1), Err(HrunError::ResizeFailed(_))));
        drop(pair);
        assert_eq!(manager.open_pairs(), 0);
    }

    #[tokio::test]
    async fn drop_releases_counter() {
        let manager = PtyManager::new();
        {
            let _a = manager.open().unwrap();
            let _b = manager.open().unwrap();
            assert_eq!(manager.open_pairs(), 2);
        }
        assert_eq!(manager.open_pairs(), 0);
    }

    #[tokio::test]
    async fn controller_reads_what_subordinate_writes() {
        let manager = PtyManager::new();
        let pair = manager.open().unwrap();
        let controller = pair.controller().unwrap();

        let sub = pair.subordinate().unwrap().as_fd().try_clone_to_owned().unwrap();
        let mut sub = File::from(sub);
        sub.write_all(b"hello-pty").unwrap();

        let mut seen = Vec::new();
        let mut buf = [0u8; 64];
        while !String::from_utf8_lossy(&seen).contains("hello-pty") {
            let n = tokio::time::timeout(std::time::Duration::from_secs(5), controller.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert!(n > 0);
            seen.extend_from_slice(&buf[..n]);
        }
    }

    #[tokio::test]
    async fn eof_char_defaults_to_ctrl_d() {
        let manager = PtyManager::new();
        let pair = manager.open().unwrap();
        assert_eq!(pair.controller().unwrap().eof_char(), CTRL_D);
    }

    #[tokio::test]
    async fn controller_sees_eof_after_subordinate_hangup() {
        let manager = PtyManager::new();
        let mut pair = manager.open().unwrap();
        let controller = pair.controller().unwrap();
        pair.release_subordinate();
        assert!(pair.subordinate().is_err());

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(std::time::Duration::from_secs(5), controller.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }
}
