//! Transport and decode errors for the client command protocol.

use std::time::Duration;

/// Errors raised by [`crate::protocol::FahConnection`] and the message decoder.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("I/O error talking to {address}: {source}")]
    Io {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connect to {address} timed out after {}s", timeout.as_secs())]
    ConnectTimeout { address: String, timeout: Duration },

    #[error("connection to {0} is closed")]
    Closed(String),

    #[error("malformed message header: {0:?}")]
    MalformedHeader(String),

    #[error("{kind} message exceeds {limit} bytes ({size} buffered)")]
    FrameTooLarge {
        kind: String,
        size: usize,
        limit: usize,
    },

    #[error("failed to decode {kind} message: {source}")]
    Json {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ProtocolError {
    pub(crate) fn io(address: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            address: address.into(),
            source,
        }
    }

    /// Whether the error means the connection must be re-established.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::ConnectTimeout { .. } | Self::Closed(_)
        )
    }
}
