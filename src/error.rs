//! Error types for the WebSocket endpoint

use std::io;

use thiserror::Error;

/// Result type alias for WebSocket operations
pub type Result<T> = std::result::Result<T, Error>;

/// WebSocket error types
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the underlying socket
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
    /// The upgrade request was rejected
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    /// The peer broke the framing rules
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    /// A frame or reassembled message exceeds the configured maximum
    #[error("payload too large: {declared} bytes exceeds limit of {limit}")]
    PayloadTooLarge {
        /// Length declared by the peer (or accumulated so far)
        declared: u64,
        /// Configured maximum
        limit: u64,
    },
    /// Invalid UTF-8 in a text message or close reason
    #[error("invalid UTF-8 in text payload")]
    InvalidUtf8,
    /// Close frame carried a status code that may not appear on the wire
    #[error("invalid close code: {0}")]
    InvalidCloseCode(u16),
    /// The session is closing or closed
    #[error("connection closed")]
    ConnectionClosed,
    /// Operation not valid in the current state
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

/// Coarse error category reported to the application layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Upgrade request rejected
    Handshake,
    /// Framing rules violated (Close 1002)
    ProtocolViolation,
    /// Declared or reassembled length over the limit (Close 1009)
    PayloadTooLarge,
    /// Text payload was not UTF-8 (Close 1007)
    InvalidPayload,
    /// Socket failure
    Io,
    /// Session already closing or closed
    Closed,
}

impl Error {
    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) => ErrorKind::Io,
            Error::Handshake(_) => ErrorKind::Handshake,
            Error::Protocol(_) | Error::InvalidCloseCode(_) => ErrorKind::ProtocolViolation,
            Error::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
            Error::InvalidUtf8 => ErrorKind::InvalidPayload,
            Error::ConnectionClosed | Error::InvalidState(_) => ErrorKind::Closed,
        }
    }

    /// Status code of the Close frame this error must produce, if any
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Error::Protocol(_) | Error::InvalidCloseCode(_) => Some(CloseReason::PROTOCOL_ERROR),
            Error::PayloadTooLarge { .. } => Some(CloseReason::TOO_BIG),
            Error::InvalidUtf8 => Some(CloseReason::INVALID_PAYLOAD),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset => Error::ConnectionClosed,
            _ => Error::Io(e),
        }
    }
}

/// Reasons an upgrade request is refused with `400 Bad Request`
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Request head could not be parsed as HTTP/1.1
    #[error("malformed HTTP request")]
    MalformedRequest,
    /// Request head grew past the size limit before completing
    #[error("request head exceeds {0} bytes")]
    RequestTooLarge(usize),
    /// Upgrade requests must use GET
    #[error("method must be GET, got {0}")]
    InvalidMethod(String),
    /// A required header is absent
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),
    /// `Upgrade` does not name `websocket`
    #[error("Upgrade header must be 'websocket'")]
    NotWebSocketUpgrade,
    /// `Connection` does not contain the `Upgrade` token
    #[error("Connection header must contain 'Upgrade'")]
    NotConnectionUpgrade,
    /// `Sec-WebSocket-Key` is not base64 of 16 bytes
    #[error("Sec-WebSocket-Key must be base64 of 16 bytes")]
    InvalidKey,
    /// Version other than 13 requested
    #[error("unsupported WebSocket version: {0}")]
    UnsupportedVersion(String),
    /// Header value is not valid UTF-8
    #[error("header value is not valid UTF-8")]
    InvalidHeaderValue,
}

/// Close frame reason
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
    /// Going away (e.g., server shutdown)
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Unsupported data
    pub const UNSUPPORTED: u16 = 1003;
    /// No status received
    pub const NO_STATUS: u16 = 1005;
    /// Abnormal closure
    pub const ABNORMAL: u16 = 1006;
    /// Invalid frame payload
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// Policy violation
    pub const POLICY: u16 = 1008;
    /// Message too big
    pub const TOO_BIG: u16 = 1009;
    /// Mandatory extension
    pub const EXTENSION: u16 = 1010;
    /// Internal server error
    pub const INTERNAL: u16 = 1011;

    /// Create a new close reason
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Check if the close code may appear in a Close frame on the wire
    pub fn is_valid_code(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_codes_for_errors() {
        assert_eq!(Error::Protocol("x").close_code(), Some(1002));
        assert_eq!(Error::InvalidCloseCode(999).close_code(), Some(1002));
        assert_eq!(
            Error::PayloadTooLarge {
                declared: 10,
                limit: 5
            }
            .close_code(),
            Some(1009)
        );
        assert_eq!(Error::InvalidUtf8.close_code(), Some(1007));
        assert_eq!(Error::ConnectionClosed.close_code(), None);
    }

    #[test]
    fn test_io_error_mapping() {
        let eof: Error = io::Error::from(io::ErrorKind::UnexpectedEof).into();
        assert!(matches!(eof, Error::ConnectionClosed));

        let other: Error = io::Error::other("boom").into();
        assert_eq!(other.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_valid_close_codes() {
        assert!(CloseReason::is_valid_code(1000));
        assert!(CloseReason::is_valid_code(4999));
        assert!(!CloseReason::is_valid_code(1005));
        assert!(!CloseReason::is_valid_code(1006));
        assert!(!CloseReason::is_valid_code(999));
        assert!(!CloseReason::is_valid_code(5000));
    }
}
