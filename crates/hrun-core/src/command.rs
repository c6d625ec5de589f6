//! Command record codec.
//!
//! The first thing a client sends is a single JSON object terminated by a
//! newline:
//!
//! ```text
//! {"Command":["prog","arg1"],"Width":80,"Height":24}\n
//! ```
//!
//! Everything after that newline is raw terminal input.

use crate::error::{HrunError, HrunResult};
use serde::{Deserialize, Deserializer, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Default upper bound for the command record, newline included.
pub const DEFAULT_MAX_COMMAND_BYTES: usize = 64 * 1024;

/// A request to run `argv` on a terminal of `width` x `height` cells.
///
/// A width or height of 0 means the client could not determine it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    #[serde(rename = "Command", default, deserialize_with = "null_as_empty")]
    pub argv: Vec<String>,
    #[serde(rename = "Width", default)]
    pub width: u16,
    #[serde(rename = "Height", default)]
    pub height: u16,
}

impl CommandRequest {
    /// Build a request, rejecting an empty argument vector.
    pub fn new(argv: Vec<String>, width: u16, height: u16) -> HrunResult<Self> {
        if argv.is_empty() {
            return Err(HrunError::EmptyCommand);
        }
        Ok(Self {
            argv,
            width,
            height,
        })
    }

    /// The executable name (`argv[0]`).
    pub fn program(&self) -> &str {
        // `new` and `decode_command` never produce an empty argv.
        self.argv.first().map(String::as_str).unwrap_or_default()
    }

    /// Arguments after the executable name.
    pub fn args(&self) -> &[String] {
        self.argv.get(1..).unwrap_or_default()
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Serialize a request into one newline-terminated record.
pub fn encode_command(request: &CommandRequest) -> HrunResult<Vec<u8>> {
    if request.argv.is_empty() {
        return Err(HrunError::EmptyCommand);
    }
    let mut record = serde_json::to_vec(request)?;
    record.push(b'\n');
    Ok(record)
}

/// Parse one record (with or without its trailing newline).
pub fn decode_command(record: &[u8]) -> HrunResult<CommandRequest> {
    let request: CommandRequest = serde_json::from_slice(record)?;
    if request.argv.is_empty() {
        return Err(HrunError::EmptyCommand);
    }
    Ok(request)
}

/// Read and decode the command record from the head of a stream.
///
/// At most `max_bytes` are consumed. Bytes that follow the newline stay in
/// `reader`'s buffer for whoever reads next.
pub async fn read_command<R>(reader: &mut R, max_bytes: usize) -> HrunResult<CommandRequest>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let mut limited = reader.take(max_bytes as u64);
    limited.read_until(b'\n', &mut line).await?;

    if line.last() != Some(&b'\n') {
        if line.len() >= max_bytes {
            return Err(HrunError::MalformedCommand(format!(
                "command record exceeds {max_bytes} bytes"
            )));
        }
        return Err(HrunError::MalformedCommand(
            "connection closed before command record".into(),
        ));
    }

    decode_command(&line)
}
