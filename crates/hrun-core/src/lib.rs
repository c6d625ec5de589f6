//! hrun-core: Shared protocol library for hrun (host run).
//!
//! Provides the JSON command record codec, the in-band `resize:` control
//! records and their stream scanner, the error taxonomy, and the transport
//! endpoints (Unix socket or TCP) used by both the server and the client.

pub mod command;
pub mod control;
pub mod error;
pub mod transport;

// Re-export commonly used items at crate root.
pub use command::{decode_command, encode_command, CommandRequest};
pub use control::{ControlScanner, Resize, ScanItem};
pub use error::{HrunError, HrunResult};
pub use transport::{connect, Connection, Endpoint, Listener};
