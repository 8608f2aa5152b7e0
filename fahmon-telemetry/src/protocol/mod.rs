//! Folding@home client command protocol.
//!
//! The client pushes self-delimited frames over its command socket:
//!
//! ```text
//! PyON <version> <type>\n
//! <body>\n
//! ---\n
//! ```
//!
//! Anything outside a frame (the welcome banner, `> ` prompts) is discarded.
//! Bodies are PyON; see [`pyon`].

mod connection;
pub mod messages;
pub mod pyon;

pub use connection::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_HEARTBEAT_TIMEOUT, FahConnection, SLOT_OPTION_KEYS,
    slot_options_command, subscription_commands,
};

use crate::error::ProtocolError;
use serde::de::DeserializeOwned;
use std::fmt;

const HEADER_PREFIX: &[u8] = b"PyON ";
const TERMINATOR: &[u8] = b"\n---\n";

/// Largest frame the decoder buffers before giving up on it.
pub const DEFAULT_MAX_FRAME_LEN: usize = 32 * 1024 * 1024;

/// Message types pushed by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Heartbeat,
    Info,
    Options,
    SlotOptions,
    Slots,
    Units,
    LogRestart,
    LogUpdate,
    /// Any type this monitor does not consume, e.g. `simulation-info`.
    Other,
}

impl MessageKind {
    pub fn parse(name: &str) -> Self {
        match name {
            "heartbeat" => Self::Heartbeat,
            "info" => Self::Info,
            "options" => Self::Options,
            "slot-options" => Self::SlotOptions,
            "slots" => Self::Slots,
            "units" => Self::Units,
            "log-restart" => Self::LogRestart,
            "log-update" => Self::LogUpdate,
            _ => Self::Other,
        }
    }
}

/// One decoded frame with its body still in PyON form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub version: u32,
    pub kind: MessageKind,
    /// Type name as sent by the client.
    pub type_name: String,
    pub body: String,
}

impl RawMessage {
    /// Decode the body into `T` after PyON rewriting.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_str(&pyon::to_json(&self.body)).map_err(|source| ProtocolError::Json {
            kind: self.type_name.clone(),
            source,
        })
    }

    pub fn json(&self) -> Result<serde_json::Value, ProtocolError> {
        self.decode()
    }
}

impl fmt::Display for RawMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes)", self.type_name, self.body.len())
    }
}

/// Incremental frame decoder.
///
/// Bytes are pushed as they arrive; complete frames are pulled with
/// [`MessageDecoder::next_frame`]. Frames may be split at any byte, including
/// inside the header prefix or a multi-byte UTF-8 sequence. Each buffered
/// byte is searched for the terminator once.
#[derive(Debug)]
pub struct MessageDecoder {
    buf: Vec<u8>,
    /// Offset where the next terminator search starts.
    scanned: usize,
    max_frame_len: usize,
}

impl Default for MessageDecoder {
    fn default() -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl MessageDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet part of a returned frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn consume(&mut self, len: usize) {
        self.buf.drain(..len);
        self.scanned = 0;
    }

    /// Pull the next complete frame.
    ///
    /// `Ok(None)` means more bytes are needed. A malformed header is dropped
    /// together with its line and reported once; decoding resumes after it.
    /// A frame growing past the size limit is discarded and reported.
    pub fn next_frame(&mut self) -> Result<Option<RawMessage>, ProtocolError> {
        let Some(start) = find(&self.buf, HEADER_PREFIX, 0) else {
            let keep = partial_prefix_len(&self.buf);
            self.consume(self.buf.len() - keep);
            return Ok(None);
        };
        if start > 0 {
            self.consume(start);
        }

        let Some(header_end) = self.buf.iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };

        let header = String::from_utf8_lossy(&self.buf[..header_end])
            .trim_end_matches('\r')
            .to_string();
        let Some((version, type_name)) = parse_header(&header) else {
            self.consume(header_end + 1);
            return Err(ProtocolError::MalformedHeader(header));
        };

        let from = self.scanned.max(header_end);
        let Some(term) = find(&self.buf, TERMINATOR, from) else {
            if self.buf.len() > self.max_frame_len {
                let size = self.buf.len();
                self.consume(size);
                return Err(ProtocolError::FrameTooLarge {
                    kind: type_name,
                    size,
                    limit: self.max_frame_len,
                });
            }
            // a terminator may straddle the end of the buffer
            self.scanned = self.buf.len().saturating_sub(TERMINATOR.len() - 1);
            return Ok(None);
        };

        let body = if term > header_end {
            String::from_utf8_lossy(&self.buf[header_end + 1..term]).into_owned()
        } else {
            String::new()
        };
        self.consume(term + TERMINATOR.len());

        Ok(Some(RawMessage {
            version,
            kind: MessageKind::parse(&type_name),
            type_name,
            body,
        }))
    }
}

fn parse_header(line: &str) -> Option<(u32, String)> {
    let mut parts = line.split_whitespace();
    if parts.next()? != "PyON" {
        return None;
    }
    let version = parts.next()?.parse().ok()?;
    let type_name = parts.next()?.to_string();
    if parts.next().is_some() {
        return None;
    }
    Some((version, type_name))
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| pos + from)
}

/// Length of the longest buffer suffix that is a proper prefix of the header.
fn partial_prefix_len(buf: &[u8]) -> usize {
    (1..HEADER_PREFIX.len())
        .rev()
        .find(|&n| buf.len() >= n && buf[buf.len() - n..] == HEADER_PREFIX[..n])
        .unwrap_or(0)
}
