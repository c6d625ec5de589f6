//! In-band resize control records.
//!
//! Wire format: `resize:<cols>:<rows>\n`, interleaved with raw terminal
//! input on the same stream. [`ControlScanner`] separates the two: it
//! forwards payload bytes untouched and pulls out anything shaped like a
//! control record.
//!
//! A record starts at the literal `resize:` and runs to the next `\n`. The
//! body may only hold printable ASCII (plus `\r`) and is capped at
//! [`MAX_CONTROL_BODY`] bytes; as soon as the candidate stops looking like a
//! record, the held bytes are released as payload so nothing is dropped.
//! A reader that goes quiet with bytes still held calls
//! [`flush_partial`](ControlScanner::flush_partial), so a lone keystroke
//! such as `r` is never parked waiting for more input.

use crate::error::{HrunError, HrunResult};
use std::fmt;

/// Literal that opens a control record.
pub const RESIZE_PREFIX: &[u8] = b"resize:";

/// Longest body accepted between the prefix and the newline.
pub const MAX_CONTROL_BODY: usize = 32;

/// A terminal geometry change requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resize {
    pub cols: u16,
    pub rows: u16,
}

impl Resize {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Encode as a newline-terminated control record.
    pub fn encode(&self) -> Vec<u8> {
        format!("resize:{}:{}\n", self.cols, self.rows).into_bytes()
    }

    /// Parse the body of a record, i.e. what follows `resize:`.
    pub fn parse_body(body: &str) -> HrunResult<Self> {
        let body = body.trim();
        let mut fields = body.split(':');
        let (Some(cols), Some(rows), None) = (fields.next(), fields.next(), fields.next()) else {
            return Err(HrunError::MalformedControl(format!(
                "expected <cols>:<rows>, got {body:?}"
            )));
        };
        let cols = cols
            .parse::<u16>()
            .map_err(|e| HrunError::MalformedControl(format!("cols {cols:?}: {e}")))?;
        let rows = rows
            .parse::<u16>()
            .map_err(|e| HrunError::MalformedControl(format!("rows {rows:?}: {e}")))?;
        Ok(Self { cols, rows })
    }

    /// Parse a whole record line, prefix included.
    pub fn parse(line: &str) -> HrunResult<Self> {
        let body = line
            .trim_end_matches(['\r', '\n'])
            .strip_prefix("resize:")
            .ok_or_else(|| HrunError::MalformedControl(format!("not a resize record: {line:?}")))?;
        Self::parse_body(body)
    }
}

impl fmt::Display for Resize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// One unit of scanner output, in stream order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanItem {
    /// Raw bytes destined for the PTY.
    Payload(Vec<u8>),
    /// The body of a control record (text between `resize:` and `\n`).
    Control(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    /// Not inside a candidate record.
    Payload,
    /// Matched this many bytes of [`RESIZE_PREFIX`].
    Prefix(usize),
    /// Full prefix seen; collecting the body.
    Body,
}

/// Streaming splitter for payload bytes and control records.
#[derive(Debug)]
pub struct ControlScanner {
    state: ScanState,
    held: Vec<u8>,
}

impl Default for ControlScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlScanner {
    pub fn new() -> Self {
        Self {
            state: ScanState::Payload,
            held: Vec::with_capacity(RESIZE_PREFIX.len() + MAX_CONTROL_BODY),
        }
    }

    /// Feed bytes and return everything that became decidable, in order.
    ///
    /// Bytes that may still turn out to be a record are held until the next
    /// call (or [`finish`](Self::finish)).
    pub fn feed(&mut self, data: &[u8]) -> Vec<ScanItem> {
        let mut items = Vec::new();
        let mut payload = Vec::with_capacity(data.len());

        for &byte in data {
            self.step(byte, &mut payload, &mut items);
        }

        if !payload.is_empty() {
            items.push(ScanItem::Payload(payload));
        }
        items
    }

    /// Release any held bytes as payload and stop matching the candidate.
    pub fn flush_partial(&mut self) -> Option<Vec<u8>> {
        self.state = ScanState::Payload;
        if self.held.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.held))
        }
    }

    /// End of stream: whatever is held is payload.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        self.flush_partial()
    }

    /// Number of bytes currently held back.
    pub fn pending(&self) -> usize {
        self.held.len()
    }

    fn step(&mut self, byte: u8, payload: &mut Vec<u8>, items: &mut Vec<ScanItem>) {
        match self.state {
            ScanState::Payload => {
                if byte == RESIZE_PREFIX[0] {
                    self.held.push(byte);
                    self.state = ScanState::Prefix(1);
                } else {
                    payload.push(byte);
                }
            }
            ScanState::Prefix(matched) => {
                if byte == RESIZE_PREFIX[matched] {
                    self.held.push(byte);
                    self.state = if matched + 1 == RESIZE_PREFIX.len() {
                        ScanState::Body
                    } else {
                        ScanState::Prefix(matched + 1)
                    };
                } else {
                    // Rescan the mismatched byte; it may open a new candidate.
                    self.release(payload);
                    self.step(byte, payload, items);
                }
            }
            ScanState::Body => {
                let body_len = self.held.len() - RESIZE_PREFIX.len();
                if byte == b'\n' {
                    if !payload.is_empty() {
                        items.push(ScanItem::Payload(std::mem::take(payload)));
                    }
                    let body = String::from_utf8_lossy(&self.held[RESIZE_PREFIX.len()..])
                        .into_owned();
                    items.push(ScanItem::Control(body));
                    self.held.clear();
                    self.state = ScanState::Payload;
                } else if body_len < MAX_CONTROL_BODY && (byte.is_ascii_graphic() || byte == b'\r')
                {
                    self.held.push(byte);
                } else {
                    self.release(payload);
                    self.step(byte, payload, items);
                }
            }
        }
    }

    fn release(&mut self, payload: &mut Vec<u8>) {
        payload.append(&mut self.held);
        self.state = ScanState::Payload;
    }
}
