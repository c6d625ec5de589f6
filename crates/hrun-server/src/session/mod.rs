//! Session management: PTY allocation, child supervision, relay.

pub mod process;
pub mod pty;
pub mod relay;

pub use pty::PtyManager;
pub use relay::{DrainReason, RelaySettings, SessionOutcome, SessionRelay};
