//! Error types and close-code taxonomy

use std::fmt;
use std::io;
use std::sync::Arc;

use bytes::Bytes;

/// Result type alias for WebSocket operations
pub type Result<T> = std::result::Result<T, Error>;

/// WebSocket error types
///
/// Every variant maps to a close code via [`Error::close_code`]; the frame
/// the engine emits on teardown carries that code. The enum is cheaply
/// cloneable so the connection's one-shot error slot can hand the same error
/// to `on_close` and to late writers.
#[derive(Debug, Clone)]
pub enum Error {
    /// I/O error from the underlying transport
    Io(Arc<io::Error>),
    /// Protocol violation (malformed frame, bad masking, fragmentation rule)
    Protocol(&'static str),
    /// Invalid UTF-8 in a text message or close reason
    InvalidUtf8,
    /// Payload exceeds the configured limit
    MessageTooLarge,
    /// Compression or decompression failure
    Compression(String),
    /// Close frame observed (local or remote)
    Close(CloseInfo),
    /// Operation on a connection that has already been torn down
    ConnClosed,
}

impl Error {
    /// Close code carried by the frame emitted for this error
    pub fn close_code(&self) -> u16 {
        match self {
            Error::Protocol(_) => close_code::PROTOCOL_ERROR,
            Error::InvalidUtf8 => close_code::UNSUPPORTED_DATA,
            Error::MessageTooLarge => close_code::MESSAGE_TOO_BIG,
            Error::Compression(_) => close_code::INTERNAL_ERROR,
            Error::Close(info) => info.code,
            // Clean local shutdown for everything non-WebSocket
            Error::Io(_) | Error::ConnClosed => close_code::NORMAL,
        }
    }
}

/// Close frame payload: two-byte big-endian code plus UTF-8 reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    /// Close status code; 0 means the peer sent an empty close payload
    pub code: u16,
    /// Reason bytes following the code
    pub reason: Bytes,
}

impl CloseInfo {
    /// Create a new close info
    pub fn new(code: u16, reason: impl Into<Bytes>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Close info for an empty close payload (no status received)
    pub fn empty() -> Self {
        Self {
            code: 0,
            reason: Bytes::new(),
        }
    }

    /// Reason as text, if it is valid UTF-8
    pub fn reason_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.reason).ok()
    }
}

impl fmt::Display for CloseInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "close code {}", self.code)?;
        if let Some(reason) = self.reason_str() {
            if !reason.is_empty() {
                write!(f, ": {reason}")?;
            }
        }
        Ok(())
    }
}

/// RFC 6455 close status codes
pub mod close_code {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Going away (endpoint shutting down)
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Unsupported data (invalid payload for the message type)
    pub const UNSUPPORTED_DATA: u16 = 1007;
    /// Message too big
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    /// Internal error
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// Outcome of validating a close code received on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseCodeEcho {
    /// Standard-range code: reply with 1000
    Normal,
    /// Application-range code (3000-4999): reply with the code itself
    AsIs,
    /// Reserved or out-of-range code: reply with 1002
    Reject,
}

/// Classify an inbound close code per RFC 6455 §7.4
///
/// 1004-1006 and 1014-1015 are reserved and must not appear on the wire;
/// 1016-2999 are unassigned protocol range; anything below 1000 or at 5000
/// and above is invalid.
pub(crate) fn echo_policy(code: u16) -> CloseCodeEcho {
    match code {
        1004 | 1005 | 1006 | 1014 | 1015 => CloseCodeEcho::Reject,
        3000..=4999 => CloseCodeEcho::AsIs,
        1000..=1015 => CloseCodeEcho::Normal,
        _ => CloseCodeEcho::Reject,
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Error::InvalidUtf8 => write!(f, "invalid UTF-8 in text payload"),
            Error::MessageTooLarge => write!(f, "message too large"),
            Error::Compression(msg) => write!(f, "compression error: {msg}"),
            Error::Close(info) => write!(f, "{info}"),
            Error::ConnClosed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}
