//! Error types for the MCP client runtime

use thiserror::Error;

use crate::protocol::{ProgressToken, RequestId};

/// Errors that can occur while talking to an MCP server
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// `connect` was called on a client or transport that is already connected
    #[error("Already connected")]
    AlreadyConnected,

    /// An operation that needs a live connection was attempted without one
    #[error("Not connected")]
    NotConnected,

    /// A request id was reused while an earlier request with that id is still in flight
    #[error("Duplicate request id: {0}")]
    DuplicateRequestId(RequestId),

    /// A progress token was reused while an earlier call with that token is still in flight
    #[error("Duplicate progress token: {0}")]
    DuplicateProgressToken(ProgressToken),

    /// Transport error
    #[error("Transport error: {0}")]
    TransportError(String),

    /// The connection was closed
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    UrlError(String),

    /// Request timeout
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Parse error
    #[error("Parse error: {0}")]
    ParseError(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    JsonError(String),

    /// The server answered the handshake with a protocol version we cannot speak
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    /// Server error
    #[error("Server error {0}: {1}")]
    ServerError(i32, String, Option<serde_json::Value>),

    /// The requested feature is not supported by the server
    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Internal error
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Coarse classification of an [`Error`], used for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The API was misused (already/not connected, duplicate ids)
    Connection,
    /// The raw channel failed
    Transport,
    /// A correlated response did not arrive in time
    Timeout,
    /// The peer sent something malformed or unexpected
    Protocol,
    /// The peer rejected the request with a structured error
    Server,
    /// Invalid configuration or unsupported feature
    Config,
    /// Broken internal invariant
    Internal,
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::AlreadyConnected
            | Error::NotConnected
            | Error::DuplicateRequestId(_)
            | Error::DuplicateProgressToken(_) => ErrorKind::Connection,
            Error::TransportError(_)
            | Error::ConnectionClosed(_)
            | Error::IoError(_)
            | Error::UrlError(_) => ErrorKind::Transport,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::ProtocolError(_)
            | Error::ParseError(_)
            | Error::JsonError(_)
            | Error::UnsupportedVersion(_) => ErrorKind::Protocol,
            Error::ServerError(..) => ErrorKind::Server,
            Error::UnsupportedFeature(_) | Error::ConfigError(_) => ErrorKind::Config,
            Error::InternalError(_) => ErrorKind::Internal,
        }
    }

    /// True when the caller misused the connection API
    pub fn is_connection_error(&self) -> bool {
        self.kind() == ErrorKind::Connection
    }

    /// True when the network or the peer process failed
    pub fn is_transport_error(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }

    /// True when a request deadline expired
    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }

    /// True when the peer sent a malformed or unexpected message
    pub fn is_protocol_error(&self) -> bool {
        self.kind() == ErrorKind::Protocol
    }

    /// True when the peer rejected the request
    pub fn is_server_error(&self) -> bool {
        self.kind() == ErrorKind::Server
    }

    /// Whether retrying the same operation later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transport | ErrorKind::Timeout)
    }
}

/// Result type using our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::JsonError(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(err.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::UrlError(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout(err.to_string())
        } else {
            Error::TransportError(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                Error::ConnectionClosed(err.to_string())
            }
            WsError::Url(_) => Error::UrlError(err.to_string()),
            other => Error::TransportError(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_separate_misuse_from_failures() {
        assert!(Error::AlreadyConnected.is_connection_error());
        assert!(Error::NotConnected.is_connection_error());
        assert!(Error::DuplicateRequestId(7.into()).is_connection_error());
        assert!(Error::DuplicateProgressToken("t".into()).is_connection_error());

        let closed = Error::ConnectionClosed("eof".to_string());
        assert!(closed.is_transport_error());
        assert!(closed.is_retryable());

        let rejected = Error::ServerError(-32602, "bad params".to_string(), None);
        assert!(rejected.is_server_error());
        assert!(!rejected.is_retryable());
        assert!(!rejected.is_connection_error());

        assert!(Error::Timeout("slow".to_string()).is_timeout());
        assert!(Error::UnsupportedVersion("1999-01-01".to_string()).is_protocol_error());
    }

    #[test]
    fn test_display_includes_server_code() {
        let err = Error::ServerError(-32601, "Method not found".to_string(), None);
        assert_eq!(err.to_string(), "Server error -32601: Method not found");
    }
}
