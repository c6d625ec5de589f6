//! Local terminal handling: raw mode and geometry.
//!
//! Wraps crossterm's terminal operations and provides a RAII guard that
//! restores the terminal state on drop.

use anyhow::{Context, Result};
use crossterm::terminal;
use crossterm::tty::IsTty;

/// RAII guard that restores the terminal to its previous mode on drop.
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    /// Enter raw terminal mode.
    pub fn enter() -> Result<Self> {
        terminal::enable_raw_mode().context("failed to enable raw terminal mode")?;
        Ok(Self { _private: () })
    }

    /// Enter raw mode only when stdin is a terminal.
    pub fn enter_if_tty() -> Result<Option<Self>> {
        if stdin_is_tty() {
            Self::enter().map(Some)
        } else {
            Ok(None)
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

pub fn stdin_is_tty() -> bool {
    std::io::stdin().is_tty()
}

/// Current terminal size as (columns, rows).
///
/// `(0, 0)` means unknown: stdin is not a terminal or the size query failed.
pub fn terminal_size() -> (u16, u16) {
    if !stdin_is_tty() {
        return (0, 0);
    }
    terminal::size().unwrap_or((0, 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_is_unknown_or_complete() {
        let (cols, rows) = terminal_size();
        // Under a test harness stdin is usually not a terminal.
        assert_eq!(cols == 0, rows == 0);
    }

    #[test]
    fn no_guard_without_tty() {
        if !stdin_is_tty() {
            assert!(RawModeGuard::enter_if_tty().unwrap().is_none());
        }
    }
}
