//! Error types for the protocol engine

use std::fmt;
use std::io;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Engine error types
///
/// Errors the engine detects itself (`Protocol`, `BadPayload`, `TooBig`,
/// `Compression`) fail the connection: a close frame with the mapped status
/// code is emitted best-effort, the transport is torn down, and the session
/// becomes terminal. Subsequent operations return [`Error::Failed`].
#[derive(Debug)]
pub enum Error {
    /// I/O error from the underlying transport
    Io(io::Error),
    /// Peer violated RFC 6455 framing rules (close code 1002)
    Protocol(&'static str),
    /// Invalid UTF-8 in a text message or close reason (close code 1007)
    BadPayload(&'static str),
    /// Message exceeds `msg_max` or the size counter would overflow (close code 1009)
    TooBig,
    /// Inflate or deflate failure (treated as a protocol violation, close code 1002)
    Compression(String),
    /// Caller misuse of the send pipeline (e.g. a new message while a
    /// fragmented one is still open)
    SendState(&'static str),
    /// Payload too large for the frame type (control frames carry at most 125 bytes)
    Capacity(&'static str),
    /// Extension negotiation failure, raised by the upgrade collaborator
    HandshakeFailed(&'static str),
    /// Close handshake completed; carries the peer's close reason if any
    Closed(Option<CloseReason>),
    /// The session was failed earlier; no transport I/O was attempted
    Failed,
}

/// Close frame status code and reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Close status code
    pub code: u16,
    /// Optional reason string
    pub reason: String,
}

impl CloseReason {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Going away (e.g. endpoint shutdown)
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Unsupported data
    pub const UNSUPPORTED: u16 = 1003;
    /// Invalid frame payload (bad UTF-8)
    pub const BAD_PAYLOAD: u16 = 1007;
    /// Policy violation
    pub const POLICY: u16 = 1008;
    /// Message too big
    pub const TOO_BIG: u16 = 1009;
    /// Mandatory extension missing
    pub const EXTENSION: u16 = 1010;
    /// Internal error
    pub const INTERNAL: u16 = 1011;

    /// Create a new close reason
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Check whether a close code may appear on the wire per RFC 6455
    ///
    /// The 3000-4999 range is accepted and echoed but never originated by
    /// this engine.
    pub fn is_valid_code(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

impl Error {
    /// Close code emitted when failing the connection for this error
    pub(crate) fn close_code(&self) -> Option<u16> {
        match self {
            Error::Protocol(_) | Error::Compression(_) => Some(CloseReason::PROTOCOL_ERROR),
            Error::BadPayload(_) => Some(CloseReason::BAD_PAYLOAD),
            Error::TooBig => Some(CloseReason::TOO_BIG),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Error::BadPayload(msg) => write!(f, "bad payload: {}", msg),
            Error::TooBig => write!(f, "message too large"),
            Error::Compression(msg) => write!(f, "compression error: {}", msg),
            Error::SendState(msg) => write!(f, "send state error: {}", msg),
            Error::Capacity(msg) => write!(f, "capacity exceeded: {}", msg),
            Error::HandshakeFailed(msg) => write!(f, "handshake failed: {}", msg),
            Error::Closed(reason) => {
                if let Some(r) = reason {
                    write!(f, "connection closed: {} ({})", r.code, r.reason)
                } else {
                    write!(f, "connection closed")
                }
            }
            Error::Failed => write!(f, "connection failed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<crate::bits::NeedMoreInput> for Error {
    fn from(_: crate::bits::NeedMoreInput) -> Self {
        Error::Protocol("truncated frame header")
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => e,
            Error::Closed(_) => io::Error::new(io::ErrorKind::BrokenPipe, "connection closed"),
            other => io::Error::other(other.to_string()),
        }
    }
}
